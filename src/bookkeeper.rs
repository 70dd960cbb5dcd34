//! Read/write operations over the durable outbox (`published`) and inbox
//! (`received`) tables.
//!
//! Every call opens its own connection and closes it before returning.
//! Lookups that find nothing return `None` or an empty `Vec`, never an error.
use crate::db::{self, repo, ConnectionProvider};
use crate::error::StoreError;
use crate::model::{
    MessageEnvelope, MessageType, NewPublishedMessage, NewReceivedMessage, PublishedMessage,
    ReceivedMessage, StatusName,
};
use chrono::Utc;
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Bookkeeper {
    provider: Arc<dyn ConnectionProvider>,
}

impl Bookkeeper {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    #[instrument(skip_all)]
    pub async fn list_failed_published(&self) -> Result<Vec<PublishedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::list_published_by_status(&mut conn, StatusName::Failed).await;
        db::release(conn).await;
        result
    }

    #[instrument(skip_all)]
    pub async fn list_failed_received(&self) -> Result<Vec<ReceivedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::list_received_by_status(&mut conn, StatusName::Failed).await;
        db::release(conn).await;
        result
    }

    /// Oldest outbox row still waiting to be promoted into the queue.
    #[instrument(skip_all)]
    pub async fn next_scheduled_published(&self) -> Result<Option<PublishedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::first_published_with_status(&mut conn, StatusName::Scheduled).await;
        db::release(conn).await;
        result
    }

    #[instrument(skip_all)]
    pub async fn next_scheduled_received(&self) -> Result<Option<ReceivedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::first_received_with_status(&mut conn, StatusName::Scheduled).await;
        db::release(conn).await;
        result
    }

    #[instrument(skip_all)]
    pub async fn get_published(&self, id: i64) -> Result<Option<PublishedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::fetch_published(&mut conn, id).await;
        db::release(conn).await;
        result
    }

    #[instrument(skip_all)]
    pub async fn get_received(&self, id: i64) -> Result<Option<ReceivedMessage>, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::fetch_received(&mut conn, id).await;
        db::release(conn).await;
        result
    }

    /// Unwrap the envelope in `message.content` and insert an inbox row.
    /// Returns the new row id.
    #[instrument(skip_all)]
    pub async fn store_received(&self, message: &NewReceivedMessage) -> Result<i64, StoreError> {
        let envelope = MessageEnvelope::parse(&message.content)?;
        let mut conn = self.provider.open_connection().await?;
        let result = repo::insert_received(&mut conn, message, &envelope, Utc::now()).await;
        db::release(conn).await;
        let id = result?;
        info!(
            id,
            message_id = envelope.meta_data.message_id,
            transaction_id = envelope.meta_data.transaction_id,
            "stored received message"
        );
        Ok(id)
    }

    #[instrument(skip_all)]
    pub async fn store_published(&self, message: &NewPublishedMessage) -> Result<i64, StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::insert_published(&mut conn, message, Utc::now()).await;
        db::release(conn).await;
        let id = result?;
        info!(id, name = %message.name, "stored published message");
        Ok(id)
    }

    /// Promote a stored row into the queue: mark it `Queued` and insert its
    /// queue row in one transaction.
    #[instrument(skip_all)]
    pub async fn enqueue(&self, message_type: MessageType, id: i64) -> Result<(), StoreError> {
        let mut conn = self.provider.open_connection().await?;
        if let Err(err) = self.provider.begin_transaction(&mut conn).await {
            db::release(conn).await;
            return Err(err);
        }
        match promote(&mut conn, message_type, id).await {
            Ok(()) => {
                db::release(conn).await;
                info!(id, ?message_type, "message enqueued");
                Ok(())
            }
            Err(err) => {
                db::rollback_and_release(conn).await;
                Err(err)
            }
        }
    }

    /// Record the outcome of processing, e.g. `Succeeded` or `Failed`.
    #[instrument(skip_all)]
    pub async fn change_status(
        &self,
        message_type: MessageType,
        id: i64,
        status: StatusName,
    ) -> Result<(), StoreError> {
        let mut conn = self.provider.open_connection().await?;
        let result = repo::update_status(&mut conn, message_type, id, status).await;
        db::release(conn).await;
        result
    }
}

async fn promote(
    conn: &mut SqliteConnection,
    message_type: MessageType,
    id: i64,
) -> Result<(), StoreError> {
    repo::update_status(conn, message_type, id, StatusName::Queued).await?;
    repo::insert_queue_row(conn, id, message_type).await?;
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(())
}
