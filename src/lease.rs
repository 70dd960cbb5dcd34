//! Transactional message lease.
//!
//! A lease owns one claimed queue row. The claim is a token stamped on the
//! row in a single short write, so any number of leases can be open at once
//! and other writers are never blocked behind one. The caller settles it
//! exactly once (`acknowledge` deletes the row, `abandon` clears the token so
//! the row is visible again) and then `dispose`s it to release the
//! connection.
//!
//! While the lease is open a background task periodically refreshes the
//! claim's heartbeat so other claimants do not treat it as stale. Every access
//! to the claim, from the caller or the keep-alive task, goes through one
//! async mutex. The keep-alive task only ever `try_lock`s: if a settlement is
//! in progress the tick is skipped.

use crate::db::repo;
use crate::error::StoreError;
use crate::model::MessageType;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub keep_alive_interval: Duration,
    /// A claim whose heartbeat is older than this may be taken over.
    /// Keep it well above `keep_alive_interval`.
    pub claim_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Committed,
    RolledBack,
    Disposed,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Active => "active",
            LeaseState::Committed => "committed",
            LeaseState::RolledBack => "rolled back",
            LeaseState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The claim a lease holds, settled like a transaction.
#[async_trait]
pub trait LeaseTransaction: Send + 'static {
    /// Refresh the claim so it is not reclaimed as idle.
    async fn keep_alive(&mut self) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Release the underlying connection.
    async fn close(self) -> Result<(), StoreError>;
}

/// A claimed queue row and the connection that claimed it.
pub struct SqliteLeaseTransaction {
    conn: SqliteConnection,
    row_id: i64,
    token: String,
}

impl SqliteLeaseTransaction {
    pub fn new(conn: SqliteConnection, row_id: i64, token: String) -> Self {
        Self {
            conn,
            row_id,
            token,
        }
    }
}

#[async_trait]
impl LeaseTransaction for SqliteLeaseTransaction {
    async fn keep_alive(&mut self) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        repo::touch_claim(&mut self.conn, self.row_id, &self.token, now).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        repo::delete_claimed(&mut self.conn, self.row_id, &self.token).await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        repo::release_claim(&mut self.conn, self.row_id, &self.token).await
    }

    async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

struct LeaseInner<T> {
    tx: Option<T>,
    state: LeaseState,
}

/// One claimed queue row plus the connection that claimed it.
pub struct MessageLease<T: LeaseTransaction = SqliteLeaseTransaction> {
    message_id: i64,
    message_type: MessageType,
    inner: Arc<Mutex<LeaseInner<T>>>,
    stop_tx: Option<watch::Sender<bool>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl<T: LeaseTransaction> MessageLease<T> {
    /// Take ownership of a fresh claim and start its keep-alive task.
    pub fn start(message_id: i64, message_type: MessageType, tx: T, config: &LeaseConfig) -> Self {
        let inner = Arc::new(Mutex::new(LeaseInner {
            tx: Some(tx),
            state: LeaseState::Active,
        }));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(keep_alive_loop(
            message_id,
            Arc::clone(&inner),
            config.keep_alive_interval,
            stop_rx,
        ));
        debug!(message_id, ?message_type, "lease started");
        Self {
            message_id,
            message_type,
            inner,
            stop_tx: Some(stop_tx),
            keep_alive: Some(handle),
        }
    }

    pub fn identity(&self) -> (i64, MessageType) {
        (self.message_id, self.message_type)
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub async fn state(&self) -> LeaseState {
        self.inner.lock().await.state
    }

    /// The queue row is gone for good.
    pub async fn acknowledge(&self) -> Result<(), StoreError> {
        self.settle(LeaseState::Committed).await
    }

    /// The queue row becomes visible to other claimants.
    pub async fn abandon(&self) -> Result<(), StoreError> {
        self.settle(LeaseState::RolledBack).await
    }

    /// A failed commit or rollback leaves the lease active.
    async fn settle(&self, target: LeaseState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LeaseState::Active {
            return Err(StoreError::Settlement {
                message_id: self.message_id,
                state: inner.state,
            });
        }
        let result = match inner.tx.as_mut() {
            Some(tx) if target == LeaseState::Committed => tx.commit().await,
            Some(tx) => tx.rollback().await,
            None => {
                return Err(StoreError::Settlement {
                    message_id: self.message_id,
                    state: LeaseState::Disposed,
                })
            }
        };
        match result {
            Ok(()) => {
                inner.state = target;
                info!(message_id = self.message_id, state = %target, "lease settled");
                Ok(())
            }
            Err(err) => {
                warn!(?err, message_id = self.message_id, "lease settlement failed");
                Err(err)
            }
        }
    }

    /// Stop the keep-alive task, wait for it to exit, release the claim if it
    /// was never settled, then close the connection. Safe to call more than
    /// once.
    pub async fn dispose(&mut self) -> Result<(), StoreError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = self.keep_alive.take() {
            if let Err(err) = handle.await {
                warn!(?err, message_id = self.message_id, "keep-alive task ended abnormally");
            }
        }

        let mut inner = self.inner.lock().await;
        let Some(mut tx) = inner.tx.take() else {
            return Ok(());
        };
        if inner.state == LeaseState::Active {
            warn!(message_id = self.message_id, "disposing unsettled lease; releasing claim");
            if let Err(err) = tx.rollback().await {
                warn!(?err, message_id = self.message_id, "claim release failed; it will expire");
            }
        }
        inner.state = LeaseState::Disposed;
        tx.close().await
    }
}

impl<T: LeaseTransaction> fmt::Debug for MessageLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLease")
            .field("message_id", &self.message_id)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

impl<T: LeaseTransaction> Drop for MessageLease<T> {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            debug!(message_id = self.message_id, "lease dropped without dispose");
            let _ = stop_tx.send(true);
        }
    }
}

async fn keep_alive_loop<T: LeaseTransaction>(
    message_id: i64,
    inner: Arc<Mutex<LeaseInner<T>>>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if *stop_rx.borrow() {
                    break;
                }
                let Ok(mut guard) = inner.try_lock() else {
                    debug!(message_id, "lease busy; skipping keep-alive");
                    continue;
                };
                if guard.state != LeaseState::Active {
                    continue;
                }
                if let Some(tx) = guard.tx.as_mut() {
                    if let Err(err) = tx.keep_alive().await {
                        debug!(?err, message_id, "keep-alive refresh failed");
                    }
                }
            }
        }
    }
    debug!(message_id, "keep-alive stopped");
}
