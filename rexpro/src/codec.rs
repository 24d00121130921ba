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

//! The centralized encoding and decoding functions for the RexPro
//! envelope. All protocol bytes flow through here; the transport and
//! the test stub server both frame messages with these.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use rexpro_protocol::{Message, MessageKind, PROTOCOL_VERSION, RESERVED_LEN, SERIALIZER_MSGPACK};
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Encode one message to the writer, minting a fresh time-ordered
/// request UUID for request messages. Returns the request UUID stamped
/// into the envelope body so replies can be correlated.
pub fn encode_to<W>(msg: &Message, w: &mut W) -> Result<Uuid>
where
    W: Write,
{
    let request = match msg {
        Message::SessionRequest(_) | Message::ScriptRequest(_) => Uuid::now_v7(),
        Message::SessionResponse(m) => m.request,
        Message::ScriptResponse(m) => m.request,
        Message::Error(m) => m.request,
    };

    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &msg.body(request))
        .map_err(|e| Error::Connection(format!("serializing message body: {e}")))?;

    // The length prefix covers the serialized body bytes, not the
    // element count of the array.
    let write = |w: &mut W| -> io::Result<()> {
        w.write_u8(PROTOCOL_VERSION)?;
        w.write_u8(SERIALIZER_MSGPACK)?;
        w.write_all(&[0u8; RESERVED_LEN])?;
        w.write_u8(msg.kind() as u8)?;
        w.write_u32::<BigEndian>(body.len() as u32)?;
        w.write_all(&body)?;
        w.flush()
    };
    write(w).map_err(|e| Error::Connection(format!("writing message: {e}")))?;

    trace!("encoded {:?} message, {} body bytes", msg.kind(), body.len());
    Ok(request)
}

/// Decode one framed message from the reader, validating the envelope
/// byte by byte in wire order.
pub fn decode_from<R>(r: &mut R) -> Result<Message>
where
    R: Read,
{
    let version = read_u8(r)?;
    if version != PROTOCOL_VERSION {
        return Err(Error::Connection(format!("unsupported protocol version: {version}")));
    }

    let serializer = read_u8(r)?;
    if serializer != SERIALIZER_MSGPACK {
        return Err(Error::Connection(format!("unsupported serializer version: {serializer}")));
    }

    let mut reserved = [0u8; RESERVED_LEN];
    read_exact(r, &mut reserved)?;

    let kind_tag = read_u8(r)?;
    let kind = MessageKind::try_from(kind_tag)
        .map_err(|_| Error::Connection(format!("can't deserialize message type {kind_tag}")))?;

    let len = r
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Connection(format!("reading length prefix: {e}")))? as usize;
    if len == 0 {
        return Err(Error::Script(String::from("insufficient data received")));
    }

    let mut body = vec![0u8; len];
    read_exact(r, &mut body)?;
    trace!("decoded {:?} envelope, {} body bytes", kind, len);

    let value = rmpv::decode::read_value(&mut body.as_slice())
        .map_err(|e| Error::Connection(format!("deserializing {kind:?} body: {e}")))?;
    Message::from_body(kind, &value)
        .map_err(|e| Error::Connection(format!("malformed {kind:?} body: {e:#}")))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    r.read_u8().map_err(closed_socket)
}

/// `Read::read_exact` already loops over short reads until the buffer
/// is full or the stream ends, which is exactly the framing contract.
fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(closed_socket)
}

fn closed_socket(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Connection(String::from("socket connection has been closed"))
    } else {
        Error::Connection(format!("reading from socket: {e}"))
    }
}
