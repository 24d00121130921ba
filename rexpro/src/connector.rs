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

//! The runtime adapter seam. `Connection` and `Pool` never touch a
//! socket type directly; they go through a `Connector`, which supplies
//! connected streams and a readiness probe. The built-in `SyncConnector`
//! covers blocking callers; a cooperative scheduler can plug in its own
//! implementation without any changes to the connection or pool logic.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    os::fd::AsRawFd,
    sync::Arc,
    time::Duration,
};

use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// What a readiness probe saw on the socket.
#[derive(Copy, Clone, Debug, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// A socket that is neither readable nor writable within the probe
    /// deadline is treated as dead.
    pub fn ready(&self) -> bool {
        self.readable || self.writable
    }
}

/// A connected byte stream owned by a single connection.
pub trait Stream: Read + Write + AsRawFd + Send + fmt::Debug {
    /// Shut down both directions ahead of dropping the stream.
    fn shutdown(&self) -> io::Result<()>;

    /// Apply a deadline to individual send and receive operations.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// The two-operation runtime adapter: make a connected socket, and
/// probe one for readiness with a deadline.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<Box<dyn Stream>>;

    fn readiness(&self, stream: &dyn Stream, timeout: Duration) -> Result<Readiness>;
}

/// Look up a connector by name. `"sync"` is the only built-in; callers
/// on a cooperative scheduler should pass their own `Connector`
/// implementation to `Connection` or `Pool` instead.
pub fn connector(name: &str) -> Result<Arc<dyn Connector>> {
    match name {
        "sync" => Ok(Arc::new(SyncConnector)),
        _ => Err(Error::InvalidConnectorType(name.to_owned())),
    }
}

/// The blocking runtime adapter over `std::net::TcpStream`.
#[derive(Debug)]
pub struct SyncConnector;

impl Connector for SyncConnector {
    fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<Box<dyn Stream>> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("resolving {host}:{port}: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            trace!("dialing {}", addr);
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_read_timeout(timeout).map_err(stream_setup_err)?;
                    stream.set_write_timeout(timeout).map_err(stream_setup_err)?;
                    debug!("connected to {}", addr);
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Connection(match last_err {
            Some(e) => format!("could not connect to database {host}:{port}: {e}"),
            None => format!("{host}:{port} resolved to no addresses"),
        }))
    }

    fn readiness(&self, stream: &dyn Stream, timeout: Duration) -> Result<Readiness> {
        let mut fds =
            [PollFd::new(stream.as_raw_fd(), PollFlags::POLLIN | PollFlags::POLLOUT)];
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        poll(&mut fds, millis)
            .map_err(|e| Error::Connection(format!("polling socket readiness: {e}")))?;

        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        // An errored or hung-up socket reports as readable, matching
        // what a select() based probe would say.
        Ok(Readiness {
            readable: revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP),
            writable: revents.contains(PollFlags::POLLOUT),
        })
    }
}

impl Stream for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

fn stream_setup_err(e: io::Error) -> Error {
    Error::Connection(format!("applying socket timeout: {e}"))
}
