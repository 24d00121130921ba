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

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    connection::{Connection, ExecuteOpts},
    connector::{Connector, SyncConnector},
    error::{Error, Result},
    params::Params,
};

/// A bounded pool of connections sharing one endpoint config.
///
/// The pool grows lazily up to the configured size; once every slot is
/// live, `get` blocks until some caller returns a connection. Returned
/// connections are soft-closed, keeping their server session alive so
/// the next checkout skips the handshake.
///
/// The idle queue together with the live counter form the pool's
/// critical section: a connection is either idle in the queue or
/// checked out to exactly one caller.
pub struct Pool {
    config: Config,
    connector: Arc<dyn Connector>,
    max_size: usize,
    live: Mutex<usize>,
    idle_tx: Sender<Connection>,
    idle_rx: Receiver<Connection>,
    pool_session: Option<Uuid>,
}

impl Pool {
    /// A pool over the blocking runtime where every connection owns its
    /// own server session.
    pub fn new(config: Config) -> Result<Pool> {
        Pool::with_connector(config, Arc::new(SyncConnector), false)
    }

    /// A pool over the blocking runtime whose connections all share one
    /// server session, so bindings persist across checkouts.
    pub fn with_session(config: Config) -> Result<Pool> {
        Pool::with_connector(config, Arc::new(SyncConnector), true)
    }

    /// A pool over the given runtime connector. When `with_session` is
    /// set, one connection is opened eagerly and its session key
    /// becomes the pool-wide session every later connection reuses.
    pub fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
        with_session: bool,
    ) -> Result<Pool> {
        let (idle_tx, idle_rx) = crossbeam_channel::unbounded();
        let max_size = config.pool_size;
        let mut pool = Pool {
            config,
            connector,
            max_size,
            live: Mutex::new(0),
            idle_tx,
            idle_rx,
            pool_session: None,
        };

        if with_session {
            let mut conn = Connection::new(pool.config.clone(), pool.connector.clone());
            conn.open(false)?;
            let session = conn.session_key().ok_or_else(|| {
                Error::Connection(String::from("freshly opened connection has no session"))
            })?;
            conn.set_pool_session(session);
            pool.pool_session = Some(session);
            debug!("pool session {} established", session);

            *pool.live.lock().expect("pool lock poisoned") = 1;
            pool.put(conn);
        }

        Ok(pool)
    }

    /// Take a connection out of the pool, blocking when the pool is at
    /// capacity with nothing idle. New connections come back unopened;
    /// `create_connection` is the checkout path that also opens.
    pub fn get(&self) -> Result<Connection> {
        let mut live = self.live.lock().expect("pool lock poisoned");
        if *live >= self.max_size || !self.idle_rx.is_empty() {
            if let Ok(conn) = self.idle_rx.try_recv() {
                return Ok(conn);
            }
            // at capacity with nothing idle: wait for a return
            drop(live);
            return self
                .idle_rx
                .recv()
                .map_err(|_| Error::Connection(String::from("connection pool has shut down")));
        }

        *live += 1;
        drop(live);
        let mut conn = Connection::new(self.config.clone(), self.connector.clone());
        if let Some(session) = self.pool_session {
            conn.set_pool_session(session);
        }
        Ok(conn)
    }

    /// Return a connection to the idle queue. No liveness check happens
    /// here; a broken socket is caught on the next checkout.
    pub fn put(&self, conn: Connection) {
        self.idle_tx.send(conn).expect("pool idle queue closed");
    }

    /// Check a connection out and make sure it is open: an already
    /// opened connection gets a cheap soft open, a fresh or hard-closed
    /// one goes through the full handshake.
    #[instrument(skip_all)]
    pub fn create_connection(&self) -> Result<Connection> {
        let mut conn = self.get()?;
        let soft = conn.opened();
        if let Err(err) = conn.open(soft) {
            // the connection is lost, so its slot opens back up
            let mut live = self.live.lock().expect("pool lock poisoned");
            *live -= 1;
            return Err(err);
        }
        Ok(conn)
    }

    /// Close a connection with the given softness and return it to the
    /// pool either way.
    pub fn close_connection(&self, mut conn: Connection, soft: bool) -> Result<()> {
        let mut result = Ok(());
        if conn.opened() {
            result = conn.close(soft);
        }
        self.put(conn);
        result
    }

    /// Check a connection out, run the block with it, and soft-close it
    /// back into the pool on every exit path.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.create_connection()?;
        let result = f(&mut conn);
        if let Err(close_err) = self.close_connection(conn, true) {
            warn!("returning connection to pool: {}", close_err);
        }
        result
    }

    /// Like `with_connection`, but the block runs inside a scoped
    /// transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.create_connection()?;
        let result = conn.transaction(f);
        if let Err(close_err) = self.close_connection(conn, true) {
            warn!("returning connection to pool: {}", close_err);
        }
        result
    }

    /// Drain the idle queue and hard-close everything in it for a clean
    /// shutdown. With `force_commit`, a final commit is issued on each
    /// connection first. Individual failures are swallowed so the drain
    /// always finishes.
    #[instrument(skip_all)]
    pub fn close_all(&self, force_commit: bool) {
        while let Ok(mut conn) = self.idle_rx.try_recv() {
            *self.live.lock().expect("pool lock poisoned") -= 1;
            if force_commit {
                let opts = ExecuteOpts { isolate: false, transaction: false, ..Default::default() };
                if let Err(err) = conn.execute_opts("g.stopTransaction(SUCCESS)", Params::new(), opts)
                {
                    debug!("final commit while draining pool: {}", err);
                }
            }
            if let Err(err) = conn.close(false) {
                debug!("closing drained connection: {}", err);
            }
        }
    }

    /// The session key all of this pool's connections share, when the
    /// pool was built `with_session`.
    pub fn pool_session(&self) -> Option<Uuid> {
        self.pool_session
    }

    /// How many connections exist right now, idle or checked out.
    pub fn live_count(&self) -> usize {
        *self.live.lock().expect("pool lock poisoned")
    }

    /// How many connections are sitting idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle_rx.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::connector::{Readiness, Stream};

    /// A connector that refuses every dial, for exercising pool
    /// accounting without a live server.
    #[derive(Debug)]
    struct DeadConnector;

    impl Connector for DeadConnector {
        fn connect(
            &self,
            host: &str,
            port: u16,
            _timeout: Option<Duration>,
        ) -> Result<Box<dyn Stream>> {
            Err(Error::Connection(format!("could not connect to database {host}:{port}")))
        }

        fn readiness(&self, _stream: &dyn Stream, _timeout: Duration) -> Result<Readiness> {
            Ok(Readiness::default())
        }
    }

    fn dead_pool(size: usize) -> Pool {
        let config = Config::new("localhost", 8184, "emptygraph").pool_size(size);
        Pool::with_connector(config, Arc::new(DeadConnector), false)
            .expect("pool construction to succeed")
    }

    #[test]
    fn grows_lazily_up_to_capacity() {
        let pool = dead_pool(2);
        assert_eq!(pool.live_count(), 0);

        let first = pool.get().expect("get to succeed");
        let second = pool.get().expect("get to succeed");
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count(), 0);

        pool.put(first);
        pool.put(second);
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count(), 2);

        // live + idle stays balanced after a re-checkout
        let again = pool.get().expect("get to succeed");
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count(), 1);
        pool.put(again);
    }

    #[test]
    fn prefers_idle_connections_over_growth() {
        let pool = dead_pool(4);
        let conn = pool.get().expect("get to succeed");
        pool.put(conn);

        let _conn = pool.get().expect("get to succeed");
        assert_eq!(pool.live_count(), 1, "an idle connection should be reused, not a new one made");
    }

    #[test]
    fn failed_open_releases_the_slot() {
        let pool = dead_pool(1);
        assert_matches!(pool.create_connection(), Err(Error::Connection(_)));
        assert_eq!(pool.live_count(), 0, "a failed open must free its slot");

        // and the slot is genuinely usable again
        assert_matches!(pool.create_connection(), Err(Error::Connection(_)));
        assert_eq!(pool.live_count(), 0);
    }
}
