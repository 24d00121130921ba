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

//! Message types for the RexPro binary wire protocol.
//!
//! Every RexPro message travels inside a fixed envelope:
//!
//! ```text
//! 1 byte:  protocol version (always 1)
//! 1 byte:  serializer tag (0 = MessagePack, 1 = JSON, never emitted)
//! 4 bytes: reserved, zero filled
//! 1 byte:  message kind tag
//! big endian 4 byte word: body length prefix
//! N bytes: MessagePack encoded body
//! ```
//!
//! The body is always a MessagePack array whose first three elements are
//! the session UUID (16 bytes, all zero for "no session"), the request
//! UUID (16 bytes, minted per message and echoed by the server), and a
//! meta map. The remaining elements depend on the message kind.
//!
//! This crate only defines the types and their body layout; framing and
//! socket handling live in the `rexpro` crate.

use anyhow::anyhow;
use rmpv::Value;
use uuid::Uuid;

/// The protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serializer tag for MessagePack encoded bodies. The only serializer
/// the client emits or accepts.
pub const SERIALIZER_MSGPACK: u8 = 0;

/// Number of reserved bytes in the envelope, written and read as zeros.
pub const RESERVED_LEN: usize = 4;

/// MessageKind is the envelope tag that indicates which message follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// A server error response.
    Error = 0,
    /// A request to open or kill a session.
    SessionRequest = 1,
    /// The server response to a session request.
    SessionResponse = 2,
    /// A request to run a script.
    ScriptRequest = 3,
    /// The server response to a script request.
    ScriptResponse = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(MessageKind::Error),
            1 => Ok(MessageKind::SessionRequest),
            2 => Ok(MessageKind::SessionResponse),
            3 => Ok(MessageKind::ScriptRequest),
            5 => Ok(MessageKind::ScriptResponse),
            _ => Err(anyhow!("unknown MessageKind {}", v)),
        }
    }
}

/// ErrorFlag enumerates the `flag` values a server error response can
/// carry in its meta map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorFlag {
    InvalidMessage = 0,
    InvalidSession = 1,
    ScriptFailure = 2,
    AuthFailure = 3,
    GraphConfigError = 4,
    ChannelConfigError = 5,
    SerializationError = 6,
}

impl TryFrom<u8> for ErrorFlag {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(ErrorFlag::InvalidMessage),
            1 => Ok(ErrorFlag::InvalidSession),
            2 => Ok(ErrorFlag::ScriptFailure),
            3 => Ok(ErrorFlag::AuthFailure),
            4 => Ok(ErrorFlag::GraphConfigError),
            5 => Ok(ErrorFlag::ChannelConfigError),
            6 => Ok(ErrorFlag::SerializationError),
            _ => Err(anyhow!("unknown ErrorFlag {}", v)),
        }
    }
}

/// The script language named in a script request. Only groovy has seen
/// real-world use, but the server also recognizes the other two.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    Groovy,
    Scala,
    Java,
}

impl Language {
    /// The name of the language as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Groovy => "groovy",
            Language::Scala => "scala",
            Language::Java => "java",
        }
    }
}

/// A request to open a new session, or to kill an existing one when
/// `kill_session` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    /// The session to reference. Only meaningful for kill requests; an
    /// open request carries the zero sentinel on the wire.
    pub session: Option<Uuid>,
    /// The graph to bind the session to.
    pub graph_name: Option<String>,
    /// The variable name the graph object is bound to, usually "g".
    pub graph_obj_name: Option<String>,
    /// Ignored by the server unless auth is turned on.
    pub username: String,
    pub password: String,
    /// When set, the server destroys the referenced session instead of
    /// creating one.
    pub kill_session: bool,
}

impl SessionRequest {
    /// Assemble the meta map. Only non-default values are emitted, and a
    /// kill request emits nothing but the kill marker since the other
    /// keys make no sense on a session that is going away.
    pub fn meta(&self) -> Value {
        let mut meta: Vec<(Value, Value)> = Vec::new();
        if self.kill_session {
            meta.push(("killSession".into(), true.into()));
            return Value::Map(meta);
        }
        if let Some(graph_name) = &self.graph_name {
            meta.push(("graphName".into(), graph_name.as_str().into()));
            if let Some(graph_obj_name) = &self.graph_obj_name {
                meta.push(("graphObjName".into(), graph_obj_name.as_str().into()));
            }
        }
        Value::Map(meta)
    }

    fn body(&self, request: Uuid) -> Value {
        Value::Array(vec![
            uuid_to_value(self.session),
            uuid_to_value(Some(request)),
            self.meta(),
            self.username.as_str().into(),
            self.password.as_str().into(),
        ])
    }

    fn from_body(tail: &[Value]) -> anyhow::Result<SessionRequest> {
        let [session, _request, meta, username, password] = tail else {
            return Err(anyhow!("session request body has {} elements, want 5", tail.len()));
        };
        let meta = normalize_text(meta.clone());
        Ok(SessionRequest {
            session: none_if_nil(uuid_from_value(session)?),
            graph_name: meta_str(&meta, "graphName"),
            graph_obj_name: meta_str(&meta, "graphObjName"),
            username: text(username)?,
            password: text(password)?,
            kill_session: meta_bool(&meta, "killSession"),
        })
    }
}

/// The server's answer to a session open request. The session field of
/// the envelope carries the newly minted session key.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResponse {
    pub session: Uuid,
    pub request: Uuid,
    pub meta: Value,
    /// Script language names the server is willing to run.
    pub languages: Vec<String>,
}

impl SessionResponse {
    fn body(&self) -> Value {
        Value::Array(vec![
            uuid_to_value(Some(self.session)),
            uuid_to_value(Some(self.request)),
            self.meta.clone(),
            Value::Array(self.languages.iter().map(|l| l.as_str().into()).collect()),
        ])
    }

    fn from_body(tail: &[Value]) -> anyhow::Result<SessionResponse> {
        let [session, request, meta, languages] = tail else {
            return Err(anyhow!("session response body has {} elements, want 4", tail.len()));
        };
        let languages = match normalize_text(languages.clone()) {
            Value::Array(entries) => entries
                .into_iter()
                .map(|l| text(&l))
                .collect::<anyhow::Result<Vec<String>>>()?,
            other => return Err(anyhow!("language list is not an array: {}", other)),
        };
        Ok(SessionResponse {
            session: uuid_from_value(session)?,
            request: uuid_from_value(request)?,
            meta: normalize_text(meta.clone()),
            languages,
        })
    }
}

/// A request to run a script against the graph, with parameter bindings
/// forwarded as a MessagePack map.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    /// The session to run in, or `None` for a sessionless request (the
    /// zero sentinel on the wire).
    pub session: Option<Uuid>,
    pub language: Language,
    pub script: String,
    /// A map value of parameter bindings.
    pub params: Value,
    pub graph_name: Option<String>,
    pub graph_obj_name: Option<String>,
    /// Run in the context of the carried session. Wire default: false.
    pub in_session: bool,
    /// Wrap the script so its top-level bindings do not leak into the
    /// next request on the same session. Wire default: true.
    pub isolate: bool,
    /// Have the server wrap the script in its own transaction. Wire
    /// default: true.
    pub transaction: bool,
}

impl ScriptRequest {
    /// Assemble the meta map, emitting only values that differ from the
    /// wire defaults.
    pub fn meta(&self) -> Value {
        let mut meta: Vec<(Value, Value)> = Vec::new();
        if let Some(graph_name) = &self.graph_name {
            meta.push(("graphName".into(), graph_name.as_str().into()));
            if let Some(graph_obj_name) = &self.graph_obj_name {
                meta.push(("graphObjName".into(), graph_obj_name.as_str().into()));
            }
        }
        if self.in_session {
            meta.push(("inSession".into(), true.into()));
        }
        if !self.isolate {
            meta.push(("isolate".into(), false.into()));
        }
        if !self.transaction {
            meta.push(("transaction".into(), false.into()));
        }
        Value::Map(meta)
    }

    fn body(&self, request: Uuid) -> Value {
        Value::Array(vec![
            uuid_to_value(self.session),
            uuid_to_value(Some(request)),
            self.meta(),
            self.language.as_str().into(),
            self.script.as_str().into(),
            self.params.clone(),
        ])
    }

    fn from_body(tail: &[Value]) -> anyhow::Result<ScriptRequest> {
        let [session, _request, meta, language, script, params] = tail else {
            return Err(anyhow!("script request body has {} elements, want 6", tail.len()));
        };
        let meta = normalize_text(meta.clone());
        let language = match text(language)?.as_str() {
            "groovy" => Language::Groovy,
            "scala" => Language::Scala,
            "java" => Language::Java,
            other => return Err(anyhow!("unknown script language {:?}", other)),
        };
        Ok(ScriptRequest {
            session: none_if_nil(uuid_from_value(session)?),
            language,
            script: text(script)?,
            params: normalize_text(params.clone()),
            graph_name: meta_str(&meta, "graphName"),
            graph_obj_name: meta_str(&meta, "graphObjName"),
            in_session: meta_bool(&meta, "inSession"),
            isolate: !matches!(meta_get(&meta, "isolate"), Some(Value::Boolean(false))),
            transaction: !matches!(meta_get(&meta, "transaction"), Some(Value::Boolean(false))),
        })
    }
}

/// The server's answer to a script request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub session: Uuid,
    pub request: Uuid,
    pub meta: Value,
    /// The decoded result value tree.
    pub results: Value,
    /// The bindings left in place after the script ran.
    pub bindings: Value,
}

impl ScriptResponse {
    fn body(&self) -> Value {
        Value::Array(vec![
            uuid_to_value(Some(self.session)),
            uuid_to_value(Some(self.request)),
            self.meta.clone(),
            self.results.clone(),
            self.bindings.clone(),
        ])
    }

    fn from_body(tail: &[Value]) -> anyhow::Result<ScriptResponse> {
        let [session, request, meta, results, bindings] = tail else {
            return Err(anyhow!("script response body has {} elements, want 5", tail.len()));
        };
        Ok(ScriptResponse {
            session: uuid_from_value(session)?,
            request: uuid_from_value(request)?,
            meta: normalize_text(meta.clone()),
            results: normalize_text(results.clone()),
            bindings: normalize_text(bindings.clone()),
        })
    }
}

/// A server error response. The flag in the meta map identifies the
/// error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub session: Uuid,
    pub request: Uuid,
    pub flag: u64,
    pub message: String,
}

impl ErrorResponse {
    fn body(&self) -> Value {
        Value::Array(vec![
            uuid_to_value(Some(self.session)),
            uuid_to_value(Some(self.request)),
            Value::Map(vec![("flag".into(), self.flag.into())]),
            self.message.as_str().into(),
        ])
    }

    fn from_body(tail: &[Value]) -> anyhow::Result<ErrorResponse> {
        let [session, request, meta, message] = tail else {
            return Err(anyhow!("error response body has {} elements, want 4", tail.len()));
        };
        let meta = normalize_text(meta.clone());
        let flag = meta_get(&meta, "flag")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("error response meta carries no flag: {}", meta))?;
        Ok(ErrorResponse {
            session: uuid_from_value(session)?,
            request: uuid_from_value(request)?,
            flag,
            message: text(message)?,
        })
    }
}

/// The closed set of RexPro messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SessionRequest(SessionRequest),
    SessionResponse(SessionResponse),
    ScriptRequest(ScriptRequest),
    ScriptResponse(ScriptResponse),
    Error(ErrorResponse),
}

impl Message {
    /// The envelope tag for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SessionRequest(_) => MessageKind::SessionRequest,
            Message::SessionResponse(_) => MessageKind::SessionResponse,
            Message::ScriptRequest(_) => MessageKind::ScriptRequest,
            Message::ScriptResponse(_) => MessageKind::ScriptResponse,
            Message::Error(_) => MessageKind::Error,
        }
    }

    /// Build the body array for this message. Requests stamp in the
    /// given request UUID; responses already carry their own, echoed
    /// from the request they answer.
    pub fn body(&self, request: Uuid) -> Value {
        match self {
            Message::SessionRequest(m) => m.body(request),
            Message::SessionResponse(m) => m.body(),
            Message::ScriptRequest(m) => m.body(request),
            Message::ScriptResponse(m) => m.body(),
            Message::Error(m) => m.body(),
        }
    }

    /// Reconstruct a message from a decoded body array.
    pub fn from_body(kind: MessageKind, body: &Value) -> anyhow::Result<Message> {
        let Value::Array(tail) = body else {
            return Err(anyhow!("message body is not an array: {}", body));
        };
        match kind {
            MessageKind::SessionRequest => {
                Ok(Message::SessionRequest(SessionRequest::from_body(tail)?))
            }
            MessageKind::SessionResponse => {
                Ok(Message::SessionResponse(SessionResponse::from_body(tail)?))
            }
            MessageKind::ScriptRequest => {
                Ok(Message::ScriptRequest(ScriptRequest::from_body(tail)?))
            }
            MessageKind::ScriptResponse => {
                Ok(Message::ScriptResponse(ScriptResponse::from_body(tail)?))
            }
            MessageKind::Error => Ok(Message::Error(ErrorResponse::from_body(tail)?)),
        }
    }
}

/// Convert byte-typed strings in a decoded value tree to UTF-8 text,
/// recursively. Old servers serialize text through the raw MessagePack
/// family, which decodes as binary; everything else passes through
/// untouched.
pub fn normalize_text(value: Value) -> Value {
    match value {
        Value::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s.into()),
            Err(e) => Value::Binary(e.into_bytes()),
        },
        Value::Array(entries) => Value::Array(entries.into_iter().map(normalize_text).collect()),
        Value::Map(pairs) => Value::Map(
            pairs.into_iter().map(|(k, v)| (normalize_text(k), normalize_text(v))).collect(),
        ),
        other => other,
    }
}

/// Encode an optional UUID as its 16 raw bytes. The all-zero sentinel
/// stands in for "no session"; it is written explicitly rather than
/// letting an absent value pick the representation.
pub fn uuid_to_value(uuid: Option<Uuid>) -> Value {
    Value::Binary(uuid.unwrap_or_else(Uuid::nil).as_bytes().to_vec())
}

/// Read a UUID element, accepting both the binary and the raw-string
/// MessagePack representations.
pub fn uuid_from_value(value: &Value) -> anyhow::Result<Uuid> {
    let bytes = match value {
        Value::Binary(bytes) => bytes.as_slice(),
        Value::String(s) => s.as_bytes(),
        other => return Err(anyhow!("uuid element is not a byte string: {}", other)),
    };
    Uuid::from_slice(bytes).map_err(|e| anyhow!("parsing uuid element: {}", e))
}

fn none_if_nil(uuid: Uuid) -> Option<Uuid> {
    if uuid.is_nil() {
        None
    } else {
        Some(uuid)
    }
}

fn text(value: &Value) -> anyhow::Result<String> {
    match value {
        Value::String(s) => {
            s.clone().into_str().ok_or_else(|| anyhow!("string element is not UTF-8"))
        }
        Value::Binary(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| anyhow!("byte string element is not UTF-8: {}", e)),
        other => Err(anyhow!("element is not a string: {}", other)),
    }
}

fn meta_get<'v>(meta: &'v Value, key: &str) -> Option<&'v Value> {
    let Value::Map(pairs) = meta else {
        return None;
    };
    pairs.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v)
}

fn meta_str(meta: &Value, key: &str) -> Option<String> {
    meta_get(meta, key).and_then(Value::as_str).map(str::to_owned)
}

fn meta_bool(meta: &Value, key: &str) -> bool {
    matches!(meta_get(meta, key), Some(Value::Boolean(true)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_kind_tags() {
        let cases = vec![
            (0u8, MessageKind::Error),
            (1u8, MessageKind::SessionRequest),
            (2u8, MessageKind::SessionResponse),
            (3u8, MessageKind::ScriptRequest),
            (5u8, MessageKind::ScriptResponse),
        ];
        for (tag, kind) in cases {
            assert_eq!(MessageKind::try_from(tag).expect("tag to parse"), kind);
            assert_eq!(kind as u8, tag);
        }
        assert!(MessageKind::try_from(4).is_err());
        assert!(MessageKind::try_from(6).is_err());
    }

    #[test]
    fn error_flags() {
        for flag in 0..=6u8 {
            let parsed = ErrorFlag::try_from(flag).expect("flag to parse");
            assert_eq!(parsed as u8, flag);
        }
        assert!(ErrorFlag::try_from(7).is_err());
    }

    #[test]
    fn kill_session_meta_drops_other_keys() {
        let req = SessionRequest {
            session: Some(Uuid::now_v7()),
            graph_name: Some(String::from("graph")),
            graph_obj_name: Some(String::from("g")),
            username: String::from("rexster"),
            password: String::from("rexster"),
            kill_session: true,
        };
        assert_eq!(req.meta(), Value::Map(vec![("killSession".into(), true.into())]));
    }

    #[test]
    fn script_meta_omits_wire_defaults() {
        let req = ScriptRequest {
            session: None,
            language: Language::Groovy,
            script: String::from("g.V()"),
            params: Value::Map(vec![]),
            graph_name: None,
            graph_obj_name: None,
            in_session: false,
            isolate: true,
            transaction: true,
        };
        assert_eq!(req.meta(), Value::Map(vec![]));

        let req = ScriptRequest { in_session: true, isolate: false, transaction: false, ..req };
        assert_eq!(
            req.meta(),
            Value::Map(vec![
                ("inSession".into(), true.into()),
                ("isolate".into(), false.into()),
                ("transaction".into(), false.into()),
            ])
        );
    }

    #[test]
    fn sessionless_body_carries_zero_uuid() {
        let req = ScriptRequest {
            session: None,
            language: Language::Groovy,
            script: String::from("g.V()"),
            params: Value::Map(vec![]),
            graph_name: None,
            graph_obj_name: None,
            in_session: false,
            isolate: true,
            transaction: true,
        };
        let Value::Array(elements) = req.body(Uuid::now_v7()) else {
            panic!("body is not an array");
        };
        assert_eq!(elements[0], Value::Binary(vec![0u8; 16]));
    }

    #[test]
    fn normalize_converts_nested_byte_strings() {
        let tree = Value::Map(vec![(
            Value::Binary(b"key".to_vec()),
            Value::Array(vec![Value::Binary(b"hi".to_vec()), Value::from(7), Value::from(2.5)]),
        )]);
        let normalized = normalize_text(tree);
        assert_eq!(
            normalized,
            Value::Map(vec![(
                Value::from("key"),
                Value::Array(vec![Value::from("hi"), Value::from(7), Value::from(2.5)]),
            )])
        );
    }
}
