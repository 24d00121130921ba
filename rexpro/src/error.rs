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

//! The closed set of failure kinds the client can surface. Server
//! error responses map onto these through the flag in their meta map;
//! transport and codec problems map onto `Connection` and `Script`.

use rexpro_protocol::{ErrorFlag, ErrorResponse};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested runtime connector is not supported.
    #[error("not a supported connector type: {0}")]
    InvalidConnectorType(String),

    /// The socket could not connect or reconnect, the transport closed
    /// underneath us, or the peer spoke an unsupported protocol.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A script request failed on the server, or a client-side
    /// transaction-state or parameter check failed before any I/O.
    /// Also the generic kind for server error flags outside the known
    /// set, carrying the raw flag in the message.
    #[error("script failure: {0}")]
    Script(String),

    /// An invalid or expired session key was presented.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The supplied credentials were rejected.
    #[error("authentication failure: {0}")]
    Authentication(String),

    /// The server could not serialize the script result.
    #[error("result serialization failure: {0}")]
    Serialization(String),

    /// The graph configuration on the server is broken.
    #[error("graph configuration failure: {0}")]
    GraphConfig(String),

    /// The channel configuration on the server is broken.
    #[error("channel configuration failure: {0}")]
    ChannelConfig(String),

    /// The server could not make sense of the message it was sent.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl Error {
    /// Map a server error flag to its failure kind. Flags outside the
    /// known set degrade to a generic `Script` failure carrying the raw
    /// flag and message.
    pub fn from_flag(flag: u64, message: String) -> Error {
        let known = u8::try_from(flag).ok().and_then(|f| ErrorFlag::try_from(f).ok());
        match known {
            Some(ErrorFlag::InvalidMessage) => Error::InvalidMessage(message),
            Some(ErrorFlag::InvalidSession) => Error::InvalidSession(message),
            Some(ErrorFlag::ScriptFailure) => Error::Script(message),
            Some(ErrorFlag::AuthFailure) => Error::Authentication(message),
            Some(ErrorFlag::GraphConfigError) => Error::GraphConfig(message),
            Some(ErrorFlag::ChannelConfigError) => Error::ChannelConfig(message),
            Some(ErrorFlag::SerializationError) => Error::Serialization(message),
            None => Error::Script(format!("flag: {flag}, message: {message}")),
        }
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Error {
        Error::from_flag(resp.flag, resp.message)
    }
}
