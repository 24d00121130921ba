// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An in-process stub RexPro server. It speaks real envelopes over real
//! TCP sockets, keeps a session table, and evaluates just enough of a
//! script language (identifier lookup, `x = 5` assignment, `x + y`
//! addition) to drive the client through its paces.

use std::{
    collections::HashMap,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread, time,
};

use anyhow::Context;
use rexpro::{
    codec,
    protocol::{ErrorResponse, Message, ScriptRequest, ScriptResponse, SessionResponse},
    Config, Value,
};
use uuid::Uuid;

const ACCEPT_POLL: time::Duration = time::Duration::from_millis(10);

/// A handle for a running stub server. Shuts everything down when it
/// goes out of scope.
pub struct StubServer {
    addr: SocketAddr,
    state: Arc<State>,
    accept_handle: Option<thread::JoinHandle<()>>,
}

struct State {
    shutdown: AtomicBool,
    /// Required credentials, or None for an open server.
    creds: Option<(String, String)>,
    sessions: Mutex<HashMap<Uuid, HashMap<String, Value>>>,
    /// Clones of every accepted socket, so tests can cut them.
    conns: Mutex<Vec<TcpStream>>,
    scripts_seen: AtomicUsize,
}

impl StubServer {
    pub fn spawn() -> anyhow::Result<StubServer> {
        StubServer::spawn_inner(None)
    }

    /// A server that rejects session requests whose credentials don't
    /// match, with the AUTH_FAILURE flag.
    pub fn spawn_with_auth(username: &str, password: &str) -> anyhow::Result<StubServer> {
        StubServer::spawn_inner(Some((username.to_owned(), password.to_owned())))
    }

    fn spawn_inner(creds: Option<(String, String)>) -> anyhow::Result<StubServer> {
        let listener = TcpListener::bind("127.0.0.1:0").context("binding stub server")?;
        let addr = listener.local_addr().context("resolving stub server addr")?;
        listener.set_nonblocking(true).context("unblocking stub listener")?;

        let state = Arc::new(State {
            shutdown: AtomicBool::new(false),
            creds,
            sessions: Mutex::new(HashMap::new()),
            conns: Mutex::new(Vec::new()),
            scripts_seen: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_handle = thread::spawn(move || {
            while !accept_state.shutdown.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _peer)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(clone) = stream.try_clone() {
                            accept_state.conns.lock().expect("conns lock poisoned").push(clone);
                        }
                        let conn_state = accept_state.clone();
                        thread::spawn(move || serve_conn(stream, conn_state));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(StubServer { addr, state, accept_handle: Some(accept_handle) })
    }

    /// A client config pointed at this server.
    pub fn config(&self, graph_name: &str) -> Config {
        Config::new("127.0.0.1", self.addr.port(), graph_name)
            .timeout(time::Duration::from_secs(5))
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// How many sessions are currently open on the server.
    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().expect("sessions lock poisoned").len()
    }

    /// How many script requests the server has seen, ever.
    pub fn scripts_seen(&self) -> usize {
        self.state.scripts_seen.load(Ordering::Acquire)
    }

    /// Cut every accepted socket out from under its client.
    pub fn drop_connections(&self) {
        let mut conns = self.state.conns.lock().expect("conns lock poisoned");
        for conn in conns.drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.drop_connections();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_conn(mut stream: TcpStream, state: Arc<State>) {
    loop {
        let msg = match codec::decode_from(&mut stream) {
            Ok(msg) => msg,
            // client went away or cut the socket
            Err(_) => return,
        };
        let reply = state.reply_for(msg);
        if codec::encode_to(&reply, &mut stream).is_err() {
            return;
        }
    }
}

impl State {
    fn reply_for(&self, msg: Message) -> Message {
        match msg {
            Message::SessionRequest(req) if req.kill_session => {
                let killed = req.session.unwrap_or_else(Uuid::nil);
                self.sessions.lock().expect("sessions lock poisoned").remove(&killed);
                Message::SessionResponse(SessionResponse {
                    session: killed,
                    request: Uuid::nil(),
                    meta: Value::Map(vec![]),
                    languages: vec![],
                })
            }
            Message::SessionRequest(req) => {
                if let Some((username, password)) = &self.creds {
                    if req.username != *username || req.password != *password {
                        return error_reply(3, "invalid username or password");
                    }
                }
                let session = Uuid::now_v7();
                self.sessions
                    .lock()
                    .expect("sessions lock poisoned")
                    .insert(session, HashMap::new());
                Message::SessionResponse(SessionResponse {
                    session,
                    request: Uuid::nil(),
                    meta: Value::Map(vec![]),
                    languages: vec![String::from("groovy"), String::from("scala")],
                })
            }
            Message::ScriptRequest(req) => {
                self.scripts_seen.fetch_add(1, Ordering::AcqRel);
                let session = req.session.unwrap_or_else(Uuid::nil);
                match self.eval(&req) {
                    Ok(results) => Message::ScriptResponse(ScriptResponse {
                        session,
                        request: Uuid::nil(),
                        meta: Value::Map(vec![]),
                        results,
                        bindings: Value::Map(vec![]),
                    }),
                    Err((flag, message)) => error_reply(flag, &message),
                }
            }
            _ => error_reply(0, "stub server only accepts requests"),
        }
    }

    fn eval(&self, req: &ScriptRequest) -> Result<Value, (u64, String)> {
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        let mut bindings = None;
        if req.in_session {
            let Some(session) = req.session else {
                return Err((1, String::from("script request carries no session")));
            };
            match sessions.get_mut(&session) {
                Some(b) => bindings = Some(b),
                None => return Err((1, format!("session {session} is not open"))),
            }
        }

        let script = req.script.trim();
        if script == "g.getFeatures().toMap()" {
            return Ok(features_map());
        }
        if script == "g.stopTransaction(SUCCESS)" || script == "g.stopTransaction(FAILURE)" {
            return Ok(Value::Nil);
        }

        if let Some((name, term)) = script.split_once('=') {
            let name = name.trim().to_owned();
            let value = resolve(term.trim(), &req.params, bindings.as_deref())?;
            // isolated scripts leave no bindings behind
            if !req.isolate {
                if let Some(bindings) = bindings {
                    bindings.insert(name, value.clone());
                }
            }
            return Ok(value);
        }

        if let Some((lhs, rhs)) = script.split_once('+') {
            let lhs = resolve(lhs.trim(), &req.params, bindings.as_deref())?;
            let rhs = resolve(rhs.trim(), &req.params, bindings.as_deref())?;
            return match (lhs.as_i64(), rhs.as_i64()) {
                (Some(l), Some(r)) => Ok(Value::from(l + r)),
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(l), Some(r)) => Ok(Value::from(l + r)),
                    _ => Err((2, format!("cannot add operands in {script:?}"))),
                },
            };
        }

        resolve(script, &req.params, bindings.as_deref())
    }
}

/// Evaluate a term: an integer or float literal, a parameter name, or a
/// session binding.
fn resolve(
    term: &str,
    params: &Value,
    bindings: Option<&HashMap<String, Value>>,
) -> Result<Value, (u64, String)> {
    if let Ok(i) = term.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = term.parse::<f64>() {
        return Ok(Value::from(f));
    }
    if let Value::Map(pairs) = params {
        if let Some((_, v)) = pairs.iter().find(|(k, _)| k.as_str() == Some(term)) {
            return Ok(v.clone());
        }
    }
    if let Some(v) = bindings.and_then(|b| b.get(term)) {
        return Ok(v.clone());
    }
    Err((2, format!("unknown identifier {term:?}")))
}

fn features_map() -> Value {
    Value::Map(vec![
        (Value::from("supportsTransactions"), Value::from(true)),
        (Value::from("supportsIndices"), Value::from(true)),
        (Value::from("isWrapper"), Value::from(false)),
    ])
}

fn error_reply(flag: u64, message: &str) -> Message {
    Message::Error(ErrorResponse {
        session: Uuid::nil(),
        request: Uuid::nil(),
        flag,
        message: message.to_owned(),
    })
}
