//! Multiplexes a small number of AMQP connections across many logical
//! senders and receivers, subject to a per-connection link budget, and reaps
//! connections that go idle.
//!
//! AMQP 1.0 can multiplex arbitrarily many links over one connection, but
//! only up to the peer's advertised channel/handle budget. Opening one
//! connection per link exhausts the broker's per-namespace connection quota;
//! opening one connection per client exhausts the per-connection handle
//! budget once enough senders/receivers pile up. The pool sits between the
//! two: callers lease a connection for a small number of links and release
//! it when those links are torn down.

use std::sync::Arc;

use fe2o3_amqp::{
    connection::{ConnectionHandle, OpenError},
    sasl_profile::SaslProfile,
    Connection,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::PoolOptions;
use crate::connection_string::ConnectionString;

struct LeaseEntry {
    id: u64,
    link_refcount: u32,
    connection: Arc<AsyncMutex<ConnectionHandle<()>>>,
    idle_timer: Option<JoinHandle<()>>,
}

struct PoolState {
    leases: Vec<LeaseEntry>,
    next_id: u64,
}

struct Inner {
    amqp_url: String,
    container_id: String,
    sasl_profile: SaslProfile,
    options: PoolOptions,
    state: parking_lot::Mutex<PoolState>,
}

/// Owns every AMQP connection opened on behalf of one [`crate::client::Client`].
#[derive(Clone)]
pub struct ConnectionPool(Arc<Inner>);

impl ConnectionPool {
    /// Builds a pool for the namespace described by `connection_string`.
    pub fn new(connection_string: &ConnectionString, container_id: String, options: PoolOptions) -> Self {
        ConnectionPool(Arc::new(Inner {
            amqp_url: connection_string.to_amqp_url(),
            container_id,
            sasl_profile: SaslProfile::Plain {
                username: connection_string.shared_access_key_name.clone(),
                password: connection_string.shared_access_key.clone(),
            },
            options,
            state: parking_lot::Mutex::new(PoolState {
                leases: Vec::new(),
                next_id: 0,
            }),
        }))
    }

    /// Leases a connection with room for `num_links` more links, reusing an
    /// existing one if one has room under the per-connection budget, or
    /// opening a new one otherwise.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn lease(&self, num_links: u32) -> Result<ConnectionLease, OpenError> {
        if let Some(lease) = self.try_reuse(num_links) {
            return Ok(lease);
        }

        let connection = Connection::builder()
            .container_id(self.0.container_id.clone())
            .alt_tls_establishment(true)
            .sasl_profile(self.0.sasl_profile.clone())
            .open(self.0.amqp_url.as_str())
            .await?;

        let mut state = self.0.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.leases.push(LeaseEntry {
            id,
            link_refcount: num_links,
            connection: Arc::new(AsyncMutex::new(connection)),
            idle_timer: None,
        });
        let connection = state.leases.last().unwrap().connection.clone();
        drop(state);

        #[cfg(feature = "tracing")]
        tracing::debug!(connection_id = id, "opened new pooled connection");
        #[cfg(feature = "log")]
        log::debug!("opened new pooled connection: connection_id={id}");

        Ok(ConnectionLease {
            pool: self.clone(),
            id,
            connection,
            num_links,
        })
    }

    fn try_reuse(&self, num_links: u32) -> Option<ConnectionLease> {
        let mut state = self.0.state.lock();
        let handle_max = self.0.options.handle_max;
        let entry = state
            .leases
            .iter_mut()
            .find(|e| e.link_refcount + num_links <= handle_max)?;
        entry.link_refcount += num_links;
        if let Some(timer) = entry.idle_timer.take() {
            timer.abort();
        }
        let lease = ConnectionLease {
            pool: self.clone(),
            id: entry.id,
            connection: entry.connection.clone(),
            num_links,
        };
        Some(lease)
    }

    fn release(&self, id: u64, num_links: u32) {
        let mut state = self.0.state.lock();
        let Some(entry) = state.leases.iter_mut().find(|e| e.id == id) else {
            return;
        };
        entry.link_refcount = entry.link_refcount.saturating_sub(num_links);
        if entry.link_refcount == 0 {
            let inner = self.0.clone();
            let delay = self.0.options.idle_cleanup_delay;
            entry.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Inner::reap(&inner, id).await;
            }));
        }
    }

    /// Tears down every leased connection and clears the pool. Any
    /// subsequent `lease()` call opens fresh connections.
    pub async fn dispose(&self) {
        let entries = {
            let mut state = self.0.state.lock();
            std::mem::take(&mut state.leases)
        };
        for entry in entries {
            if let Some(timer) = entry.idle_timer {
                timer.abort();
            }
            let mut guard = entry.connection.lock().await;
            let _ = guard.close().await;
        }
    }
}

impl Inner {
    async fn reap(self_: &Arc<Inner>, id: u64) {
        let removed = {
            let mut state = self_.state.lock();
            let still_idle = state
                .leases
                .iter()
                .any(|e| e.id == id && e.link_refcount == 0);
            if !still_idle {
                None
            } else {
                let idx = state.leases.iter().position(|e| e.id == id).unwrap();
                Some(state.leases.remove(idx))
            }
        };
        if let Some(entry) = removed {
            #[cfg(feature = "tracing")]
            tracing::debug!(connection_id = id, "reaped idle pooled connection");
            #[cfg(feature = "log")]
            log::debug!("reaped idle pooled connection: connection_id={id}");
            let mut guard = entry.connection.lock().await;
            let _ = guard.close().await;
        }
    }
}

/// A lease on one link budget's worth of a pooled connection. Dropping the
/// lease releases it back to the pool.
pub struct ConnectionLease {
    pool: ConnectionPool,
    id: u64,
    connection: Arc<AsyncMutex<ConnectionHandle<()>>>,
    num_links: u32,
}

impl ConnectionLease {
    /// Begins a new AMQP session on the leased connection.
    pub async fn begin_session(
        &self,
    ) -> Result<fe2o3_amqp::session::SessionHandle<()>, fe2o3_amqp::session::BeginError> {
        let mut guard = self.connection.lock().await;
        fe2o3_amqp::Session::begin(&mut guard).await
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        // `Drop` is the only place release happens; a lease is never
        // explicitly released by calling code, so double-release is
        // impossible by construction.
        self.pool.release(self.id, self.num_links);
    }
}
