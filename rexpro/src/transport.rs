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

use std::time::Duration;

use rexpro_protocol::Message;
use tracing::trace;
use uuid::Uuid;

use crate::{
    codec,
    connector::Stream,
    error::{Error, Result},
};

/// A framed message stream over a runtime socket. Writes one encoded
/// message at a time and reads exactly one framed message back.
///
/// Taking `&mut self` for both directions is what enforces the one
/// outstanding request per connection ordering rule; there is no
/// pipelining to get wrong.
#[derive(Debug)]
pub struct Transport {
    stream: Box<dyn Stream>,
}

impl Transport {
    pub fn new(stream: Box<dyn Stream>) -> Transport {
        Transport { stream }
    }

    /// Encode and send one message, returning the request UUID stamped
    /// into it.
    pub fn send(&mut self, msg: &Message) -> Result<Uuid> {
        let request = codec::encode_to(msg, &mut self.stream)?;
        trace!("sent {:?} request {}", msg.kind(), request);
        Ok(request)
    }

    /// Read exactly one framed message.
    pub fn recv(&mut self) -> Result<Message> {
        let msg = codec::decode_from(&mut self.stream)?;
        trace!("received {:?} message", msg.kind());
        Ok(msg)
    }

    /// The underlying stream, for readiness probing.
    pub fn stream(&self) -> &dyn Stream {
        self.stream.as_ref()
    }

    /// Shut down both directions of the underlying socket.
    pub fn shutdown(&self) -> Result<()> {
        self.stream
            .shutdown()
            .map_err(|e| Error::Connection(format!("shutting down socket: {e}")))
    }

    /// Re-apply a send/receive deadline to the underlying socket.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_timeout(timeout)
            .map_err(|e| Error::Connection(format!("applying socket timeout: {e}")))
    }
}
