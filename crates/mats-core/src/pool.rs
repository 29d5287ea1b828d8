// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session and connection pooling.
//!
//! The pool keeps one physical broker connection open and carves sessions
//! from it on demand. Sessions sharing a connection form a group: when any
//! member reports [`SessionHolder::crashed`], the connection is revoked, the
//! pool stops handing out sessions on it, and the physical connection is
//! closed once the last lease comes home (via close or crash). The next
//! acquisition builds a fresh connection.
//!
//! A holder is owned by exactly one task. Stage processors keep theirs for
//! the lifetime of the consumer loop; initiators check one out per
//! initiation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerConnection, BrokerError, BrokerSession};

/// The pool's shared slot holding the current pooled connection.
type CurrentSlot = Arc<Mutex<Option<Arc<PooledConnection>>>>;

/// Pools one shared broker connection and tracks the sessions leased from
/// it.
pub struct SessionPool {
    broker: Arc<dyn Broker>,
    current: CurrentSlot,
}

struct PooledConnection {
    connection: Box<dyn BrokerConnection>,
    revoked: AtomicBool,
    leases: AtomicUsize,
}

impl SessionPool {
    pub fn new(broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            current: Arc::new(Mutex::new(None)),
        })
    }

    /// Acquire a session on the pooled connection, connecting first if
    /// there is no live connection.
    pub async fn acquire(&self) -> Result<SessionHolder, BrokerError> {
        let conn = self.current_or_connect().await?;
        match conn.connection.open_session().await {
            Ok(session) => {
                conn.leases.fetch_add(1, Ordering::SeqCst);
                Ok(SessionHolder {
                    session: Some(session),
                    conn,
                    slot: Arc::clone(&self.current),
                })
            }
            Err(e) => {
                // A connection that cannot produce sessions is broken.
                warn!(error = %e, "failed to open session; retiring connection");
                conn.revoked.store(true, Ordering::SeqCst);
                retire(&self.current, &conn).await;
                if conn.leases.load(Ordering::SeqCst) == 0 {
                    conn.connection.close().await;
                }
                Err(e)
            }
        }
    }

    /// Close the pooled connection, if any. Outstanding holders keep their
    /// sessions until they come home.
    pub async fn shutdown(&self) {
        let conn = self.current.lock().await.take();
        if let Some(conn) = conn {
            conn.revoked.store(true, Ordering::SeqCst);
            if conn.leases.load(Ordering::SeqCst) == 0 {
                conn.connection.close().await;
            }
        }
    }

    async fn current_or_connect(&self) -> Result<Arc<PooledConnection>, BrokerError> {
        let mut guard = self.current.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.revoked.load(Ordering::SeqCst) {
                return Ok(Arc::clone(conn));
            }
        }
        debug!("opening new broker connection");
        let connection = self.broker.connect().await?;
        let conn = Arc::new(PooledConnection {
            connection,
            revoked: AtomicBool::new(false),
            leases: AtomicUsize::new(0),
        });
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Drop the connection from the pool's slot if it is still the current one.
async fn retire(slot: &CurrentSlot, conn: &Arc<PooledConnection>) {
    let mut guard = slot.lock().await;
    if let Some(current) = guard.as_ref() {
        if Arc::ptr_eq(current, conn) {
            *guard = None;
        }
    }
}

/// A leased broker session plus its homecoming protocol: exactly one of
/// [`close`](Self::close), [`release`](Self::release) or
/// [`crashed`](Self::crashed) must be invoked to return the lease.
pub struct SessionHolder {
    session: Option<Box<dyn BrokerSession>>,
    conn: Arc<PooledConnection>,
    slot: CurrentSlot,
}

impl SessionHolder {
    /// The underlying session.
    pub fn session(&mut self) -> &mut dyn BrokerSession {
        self.session
            .as_mut()
            .expect("session is present until the holder is returned")
            .as_mut()
    }

    /// Pre-commit probe: `false` when the group has been revoked or the
    /// session itself reports inactive. `false` demands
    /// rollback-then-reacquire.
    pub async fn is_still_active(&self) -> bool {
        if self.conn.revoked.load(Ordering::SeqCst) {
            return false;
        }
        match &self.session {
            Some(session) => session.is_active().await,
            None => false,
        }
    }

    /// Physically close the session and return the lease. Used by stage
    /// processors.
    pub async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.return_lease().await;
    }

    /// Return the session after an initiation. The session is closed but
    /// the shared connection stays pooled for the next checkout.
    pub async fn release(self) {
        self.close().await;
    }

    /// Report that the session (or a downstream operation on it) failed.
    /// Revokes every sibling session on the same connection; the physical
    /// connection closes when the last lease comes home.
    pub async fn crashed(mut self, cause: &BrokerError) {
        warn!(error = %cause, "broker session crashed; revoking connection group");
        self.conn.revoked.store(true, Ordering::SeqCst);
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        retire(&self.slot, &self.conn).await;
        self.return_lease().await;
    }

    async fn return_lease(&self) {
        let remaining = self.conn.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.conn.revoked.load(Ordering::SeqCst) {
            debug!("last lease home on revoked connection; closing it");
            self.conn.connection.close().await;
        }
    }
}

/// Bounded exponential backoff with jitter, for re-acquiring a session
/// after a crash: 50ms base doubling per attempt, capped at 5s, uniformly
/// jittered between half and the full value.
pub fn crash_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 50;
    const CAP_MS: u64 = 5_000;
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(10)).min(CAP_MS);
    let half = exp / 2;
    let jittered = half + rand::thread_rng().gen_range(0..=exp - half);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 0..64 {
            let d = crash_backoff(attempt);
            assert!(d <= Duration::from_millis(5_000), "attempt {}", attempt);
            assert!(d >= Duration::from_millis(25), "attempt {}", attempt);
        }
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        // The lower bound of the jitter window is half the exponential
        // value, so attempt 7 is always at least 50 * 2^7 / 2 = 3200ms.
        let late = crash_backoff(7);
        assert!(late >= Duration::from_millis(3_200));
    }
}
