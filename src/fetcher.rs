//! Claims queue rows one at a time and wraps each claim in a [`MessageLease`].
use crate::db::{self, repo, ConnectionProvider};
use crate::error::StoreError;
use crate::lease::{LeaseConfig, MessageLease, SqliteLeaseTransaction};
use crate::model::MessageType;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct QueueFetcher {
    provider: Arc<dyn ConnectionProvider>,
    lease: LeaseConfig,
}

impl QueueFetcher {
    pub fn new(provider: Arc<dyn ConnectionProvider>, lease: LeaseConfig) -> Self {
        Self { provider, lease }
    }

    /// Claim the next queue row.
    ///
    /// `Ok(None)` means nothing is claimable right now: the queue is drained,
    /// every row is held by a live lease, or the store stayed locked past the
    /// busy timeout. On error the connection is closed and no claim is left
    /// behind.
    #[instrument(skip_all)]
    pub async fn fetch_next(&self) -> Result<Option<MessageLease>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let stale_before = now - self.claim_timeout_ms();

        let claimed = match repo::claim_next(&mut conn, &token, now, stale_before).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                db::release(conn).await;
                return Ok(None);
            }
            Err(StoreError::Database(err)) if db::is_busy(&err) => {
                debug!(?err, "queue locked by another writer; nothing claimed");
                db::release(conn).await;
                return Ok(None);
            }
            Err(err) => {
                db::release(conn).await;
                return Err(err);
            }
        };

        // Rows that can never be handed out are removed so they do not block
        // the head of the queue.
        if claimed.message_id == 0 {
            warn!(row_id = claimed.row_id, "discarding queue row with sentinel message id");
            let discarded = repo::delete_claimed(&mut conn, claimed.row_id, &token).await;
            db::release(conn).await;
            return discarded.map(|()| None);
        }
        let message_type = match MessageType::from_i64(claimed.message_type) {
            Ok(message_type) => message_type,
            Err(err) => {
                warn!(
                    row_id = claimed.row_id,
                    message_id = claimed.message_id,
                    message_type = claimed.message_type,
                    "discarding queue row with unknown message type"
                );
                let discarded = repo::delete_claimed(&mut conn, claimed.row_id, &token).await;
                db::release(conn).await;
                discarded?;
                return Err(err);
            }
        };

        debug!(message_id = claimed.message_id, ?message_type, "claimed queue row");
        Ok(Some(MessageLease::start(
            claimed.message_id,
            message_type,
            SqliteLeaseTransaction::new(conn, claimed.row_id, token),
            &self.lease,
        )))
    }

    fn claim_timeout_ms(&self) -> i64 {
        i64::try_from(self.lease.claim_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}
