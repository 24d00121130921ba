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

use std::{sync::Arc, time::Duration};

use rexpro_protocol::{Language, Message, ScriptRequest, SessionRequest};
use rmpv::Value;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    connector::{Connector, SyncConnector},
    error::{Error, Result},
    params::Params,
    transport::Transport,
};

/// How long the liveness probe waits before declaring the socket dead.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Probe deadlines for the reconnect attempts after a dead probe.
const RECONNECT_SCHEDULE: [Duration; 3] =
    [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

/// Per-request knobs for `Connection::execute_opts`.
#[derive(Copy, Clone, Debug)]
pub struct ExecuteOpts {
    /// Wrap the script so its top-level bindings do not persist to the
    /// next request on the same session.
    pub isolate: bool,
    /// Have the server wrap the script in its own transaction. Forced
    /// off while a client-side transaction is open, since the outer
    /// transaction governs.
    pub transaction: bool,
    pub language: Language,
}

impl Default for ExecuteOpts {
    fn default() -> Self {
        ExecuteOpts { isolate: true, transaction: true, language: Language::Groovy }
    }
}

/// A single client connection to the graph server.
///
/// A connection moves from unopened, through opened with a server
/// session bound, optionally into a transaction, and back. It is owned
/// by one caller at a time; the pool is the hand-off point between
/// callers.
///
/// ```no_run
/// use rexpro::{Config, Connection, Params};
///
/// # fn main() -> rexpro::Result<()> {
/// let config = Config::new("localhost", 8184, "emptygraph");
/// let mut conn = Connection::connect(config)?;
/// let result = conn.execute("values", Params::new().set("values", 5))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Connection {
    config: Config,
    connector: Arc<dyn Connector>,
    transport: Option<Transport>,
    session_key: Option<Uuid>,
    pool_session: Option<Uuid>,
    in_transaction: bool,
    opened: bool,
    graph_features: Option<Value>,
}

impl Connection {
    /// Build an unopened connection using the given runtime connector.
    /// No I/O happens until `open`.
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Connection {
        Connection {
            config,
            connector,
            transport: None,
            session_key: None,
            pool_session: None,
            in_transaction: false,
            opened: false,
            graph_features: None,
        }
    }

    /// Dial the server with the blocking runtime and open a session.
    pub fn connect(config: Config) -> Result<Connection> {
        let mut conn = Connection::new(config, Arc::new(SyncConnector));
        conn.open(false)?;
        Ok(conn)
    }

    /// Open the connection. A hard open (or an open on a never-opened
    /// connection) dials a fresh socket; a soft open on an opened
    /// connection reuses the one it has. Either way the connection
    /// leaves any transaction, and a session is created unless one is
    /// already bound (a pool-shared session, preserved across soft
    /// opens).
    #[instrument(skip_all)]
    pub fn open(&mut self, soft: bool) -> Result<()> {
        if !soft || !self.opened {
            debug!("dialing {}:{}", self.config.host, self.config.port);
            let stream = self.connector.connect(
                &self.config.host,
                self.config.port,
                self.config.socket_timeout(),
            )?;
            self.transport = Some(Transport::new(stream));
        }
        self.in_transaction = false;
        self.opened = true;
        if self.session_key.is_none() {
            self.open_session()?;
        }
        Ok(())
    }

    /// Close the connection. The server session is killed unless it
    /// belongs to a pool; a soft close keeps the socket and the opened
    /// flag so the connection can be revived cheaply.
    #[instrument(skip_all)]
    pub fn close(&mut self, soft: bool) -> Result<()> {
        let mut kill_result = Ok(());
        if !self.pool_owned_session() {
            if let Some(session) = self.session_key {
                debug!("killing session {}", session);
                kill_result = self
                    .request(Message::SessionRequest(SessionRequest {
                        session: Some(session),
                        graph_name: Some(self.config.graph_name.clone()),
                        graph_obj_name: None,
                        username: String::new(),
                        password: String::new(),
                        kill_session: true,
                    }))
                    .map(|_| ());
                if kill_result.is_ok() {
                    self.session_key = None;
                }
            }
        }
        if !soft {
            self.opened = false;
            self.transport = None;
        }
        self.in_transaction = false;
        kill_result
    }

    /// Run a script with default options: isolated bindings, a
    /// server-side transaction, groovy.
    pub fn execute(&mut self, script: &str, params: Params) -> Result<Value> {
        self.execute_opts(script, params, ExecuteOpts::default())
    }

    /// Run a script and return the decoded result value.
    #[instrument(skip_all)]
    pub fn execute_opts(
        &mut self,
        script: &str,
        params: Params,
        opts: ExecuteOpts,
    ) -> Result<Value> {
        // while a transaction is open the outer transaction governs
        let transaction = if self.in_transaction { false } else { opts.transaction };
        params.validate()?;

        trace!("executing {:?}", script);
        let resp = self.request(Message::ScriptRequest(ScriptRequest {
            session: self.session_key,
            language: opts.language,
            script: script.to_owned(),
            params: params.into_value(),
            graph_name: None,
            graph_obj_name: None,
            in_session: self.session_key.is_some(),
            isolate: opts.isolate,
            transaction,
        }))?;
        match resp {
            Message::ScriptResponse(resp) => Ok(resp.results),
            other => Err(Error::Connection(format!(
                "unexpected {:?} in response to a script request",
                other.kind()
            ))),
        }
    }

    /// Open a client-side transaction. Any lingering transactional
    /// state on the session is rolled back first; the server requires a
    /// stop before a fresh start.
    pub fn open_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::Script(String::from("transaction is already open")));
        }
        self.stop_transaction(false)?;
        self.in_transaction = true;
        Ok(())
    }

    /// Close the open transaction, committing on `success` and rolling
    /// back otherwise.
    pub fn close_transaction(&mut self, success: bool) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Script(String::from("transaction is not open")));
        }
        self.stop_transaction(success)?;
        self.in_transaction = false;
        Ok(())
    }

    /// Run the given block inside a transaction. The connection is
    /// probed (and repaired if its socket died) before the transaction
    /// opens. A block that returns `Ok` commits; a block that returns
    /// `Err` rolls back and the block's error is the one the caller
    /// sees.
    ///
    /// ```no_run
    /// # use rexpro::{Config, Connection, Params};
    /// # fn main() -> rexpro::Result<()> {
    /// # let mut conn = Connection::connect(Config::new("localhost", 8184, "graph"))?;
    /// conn.transaction(|conn| {
    ///     conn.execute("g.addVertex([name: n])", Params::new().set("n", "odin"))
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        self.test_connection()?;
        self.open_transaction()?;
        match f(self) {
            Ok(value) => {
                self.close_transaction(true)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.close_transaction(false) {
                    warn!("rolling back transaction: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Probe the socket, and if it looks dead, walk the reconnect
    /// schedule until a fresh socket comes up ready or the schedule is
    /// exhausted.
    #[instrument(skip_all)]
    pub fn test_connection(&mut self) -> Result<()> {
        let transport = self.transport()?;
        let readiness = self.connector.readiness(transport.stream(), PROBE_TIMEOUT)?;
        if readiness.ready() {
            return Ok(());
        }

        warn!("socket to {}:{} looks dead, reconnecting", self.config.host, self.config.port);
        for probe_timeout in RECONNECT_SCHEDULE {
            match self.reconnect(probe_timeout) {
                Ok(()) => {
                    debug!("reconnected to {}:{}", self.config.host, self.config.port);
                    return Ok(());
                }
                Err(err) => {
                    warn!("reconnect attempt ({:?} probe) failed: {}", probe_timeout, err);
                }
            }
        }
        Err(Error::Connection(format!(
            "could not reconnect to database {}:{}",
            self.config.host, self.config.port
        )))
    }

    /// True once `open` has succeeded and no hard close has happened
    /// since.
    pub fn opened(&self) -> bool {
        self.opened
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The server session this connection is bound to.
    pub fn session_key(&self) -> Option<Uuid> {
        self.session_key
    }

    /// The feature map the server reported when the session opened.
    pub fn graph_features(&self) -> Option<&Value> {
        self.graph_features.as_ref()
    }

    /// Mark this connection's session as owned by a pool: a close will
    /// not kill it, and a reconnect restores it rather than minting a
    /// fresh one.
    pub(crate) fn set_pool_session(&mut self, session: Uuid) {
        self.pool_session = Some(session);
        if self.session_key.is_none() {
            self.session_key = Some(session);
        }
    }

    fn pool_owned_session(&self) -> bool {
        self.session_key.is_some() && self.session_key == self.pool_session
    }

    /// Create a session and cache the graph feature map.
    fn open_session(&mut self) -> Result<()> {
        let resp = self.request(Message::SessionRequest(SessionRequest {
            session: None,
            graph_name: Some(self.config.graph_name.clone()),
            graph_obj_name: Some(self.config.graph_obj_name.clone()),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            kill_session: false,
        }))?;
        let session = match resp {
            Message::SessionResponse(resp) => resp.session,
            other => {
                return Err(Error::Connection(format!(
                    "unexpected {:?} in response to a session request",
                    other.kind()
                )));
            }
        };
        self.session_key = Some(session);
        debug!("opened session {}", session);

        let features = self.execute("g.getFeatures().toMap()", Params::new())?;
        self.graph_features = Some(features);
        Ok(())
    }

    fn stop_transaction(&mut self, success: bool) -> Result<()> {
        let script =
            if success { "g.stopTransaction(SUCCESS)" } else { "g.stopTransaction(FAILURE)" };
        self.execute_opts(
            script,
            Params::new(),
            ExecuteOpts { isolate: false, transaction: false, ..Default::default() },
        )?;
        Ok(())
    }

    /// One reconnect attempt: tear down the old socket, dial a fresh
    /// one, and require it to probe ready within the deadline. On
    /// success the session is restored from the pool marker or opened
    /// anew.
    fn reconnect(&mut self, probe_timeout: Duration) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.shutdown() {
                trace!("shutting down dead socket: {}", err);
            }
        }

        let stream =
            self.connector.connect(&self.config.host, self.config.port, self.config.socket_timeout())?;
        let readiness = self.connector.readiness(stream.as_ref(), probe_timeout)?;
        if !readiness.ready() {
            return Err(Error::Connection(String::from("socket still not ready after reconnect")));
        }

        let transport = Transport::new(stream);
        transport.set_timeout(self.config.socket_timeout())?;
        self.transport = Some(transport);
        self.in_transaction = false;
        match self.pool_session {
            Some(session) => self.session_key = Some(session),
            None => {
                self.session_key = None;
                self.open_session()?;
            }
        }
        Ok(())
    }

    /// Send one message and wait for its one response. Error responses
    /// become their mapped failure kind.
    fn request(&mut self, msg: Message) -> Result<Message> {
        let transport = self.transport_mut()?;
        transport.send(&msg)?;
        let resp = transport.recv()?;
        if let Message::Error(err) = resp {
            return Err(Error::from(err));
        }
        Ok(resp)
    }

    fn transport(&self) -> Result<&Transport> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::Connection(String::from("connection is not opened")))
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::Connection(String::from("connection is not opened")))
    }
}
