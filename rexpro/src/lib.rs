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

//! A client for the RexPro binary wire protocol.
//!
//! rexpro talks to a Rexster graph server over a plain stream socket:
//! it opens authenticated sessions, runs scripts with parameter
//! bindings, manages transactions with commit/rollback semantics, and
//! multiplexes callers through a bounded connection pool that probes
//! liveness and reconnects with backoff.
//!
//! Scripts are opaque strings forwarded verbatim; results come back as
//! generic [`Value`] trees decoded from MessagePack.
//!
//! ```no_run
//! use rexpro::{Config, Params, Pool};
//!
//! # fn main() -> rexpro::Result<()> {
//! let pool = Pool::new(Config::new("localhost", 8184, "emptygraph"))?;
//! let names = pool.with_transaction(|conn| {
//!     conn.execute("g.V.name", Params::new())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Socket construction and readiness probing go through the
//! [`connector::Connector`] adapter, so the same connection and pool
//! logic serves blocking callers out of the box and cooperative
//! schedulers through a caller-supplied implementation.

pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod params;
pub mod pool;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, ExecuteOpts};
pub use error::{Error, Result};
pub use params::Params;
pub use pool::Pool;
pub use rexpro_protocol as protocol;
pub use rmpv::Value;
