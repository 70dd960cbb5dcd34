use crate::error::StoreError;
use crate::model::{
    MessageEnvelope, MessageType, NewPublishedMessage, NewReceivedMessage, PublishedMessage,
    ReceivedMessage, StatusName,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::instrument;

const PUBLISHED_COLUMNS: &str = "id, name, content, message_id, transaction_id, retries, added, \
     expires_at, last_warned_time, status_name";
const RECEIVED_COLUMNS: &str = "id, name, group_name, content, message_id, transaction_id, \
     retries, added, expires_at, last_warned_time, status_name";

/// A queue row stamped with the caller's claim token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedRow {
    pub row_id: i64,
    pub message_id: i64,
    pub message_type: i64,
}

/// Stamp the oldest unclaimed (or stale) queue row with `token`.
///
/// One autocommit statement: SQLite's write lock is held only for the
/// duration of the update, never across the caller's work. A claim counts as
/// stale when its heartbeat is older than `stale_before_ms`.
#[instrument(skip_all)]
pub async fn claim_next(
    conn: &mut SqliteConnection,
    token: &str,
    now_ms: i64,
    stale_before_ms: i64,
) -> Result<Option<ClaimedRow>, StoreError> {
    let row = sqlx::query(
        "UPDATE queue SET claim_token = ?, heartbeat_at = ? \
         WHERE id = (SELECT id FROM queue \
                     WHERE claim_token IS NULL OR heartbeat_at < ? \
                     ORDER BY id LIMIT 1) \
         RETURNING id, message_id, message_type",
    )
    .bind(token)
    .bind(now_ms)
    .bind(stale_before_ms)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ClaimedRow {
        row_id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        message_type: row.try_get("message_type")?,
    }))
}

/// Remove a claimed row for good. Fails with `ClaimLost` if `token` no
/// longer owns it.
#[instrument(skip_all)]
pub async fn delete_claimed(
    conn: &mut SqliteConnection,
    row_id: i64,
    token: &str,
) -> Result<(), StoreError> {
    let affected = sqlx::query("DELETE FROM queue WHERE id = ? AND claim_token = ?")
        .bind(row_id)
        .bind(token)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    expect_claim(row_id, affected)
}

/// Clear the claim so the row is visible to other claimants again.
#[instrument(skip_all)]
pub async fn release_claim(
    conn: &mut SqliteConnection,
    row_id: i64,
    token: &str,
) -> Result<(), StoreError> {
    let affected = sqlx::query(
        "UPDATE queue SET claim_token = NULL, heartbeat_at = NULL WHERE id = ? AND claim_token = ?",
    )
    .bind(row_id)
    .bind(token)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    expect_claim(row_id, affected)
}

#[instrument(skip_all)]
pub async fn touch_claim(
    conn: &mut SqliteConnection,
    row_id: i64,
    token: &str,
    now_ms: i64,
) -> Result<(), StoreError> {
    let affected = sqlx::query("UPDATE queue SET heartbeat_at = ? WHERE id = ? AND claim_token = ?")
        .bind(now_ms)
        .bind(row_id)
        .bind(token)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    expect_claim(row_id, affected)
}

fn expect_claim(row_id: i64, affected: u64) -> Result<(), StoreError> {
    match affected {
        1 => Ok(()),
        0 => Err(StoreError::ClaimLost { row_id }),
        n => Err(StoreError::rows_affected("queue claim", 1, n)),
    }
}

#[instrument(skip_all)]
pub async fn insert_queue_row(
    conn: &mut SqliteConnection,
    message_id: i64,
    message_type: MessageType,
) -> Result<i64, StoreError> {
    let res = sqlx::query("INSERT INTO queue (message_id, message_type) VALUES (?, ?)")
        .bind(message_id)
        .bind(message_type.as_i64())
        .execute(&mut *conn)
        .await?;
    expect_one("insert queue row", res.rows_affected())?;
    Ok(res.last_insert_rowid())
}

#[instrument(skip_all)]
pub async fn list_published_by_status(
    conn: &mut SqliteConnection,
    status: StatusName,
) -> Result<Vec<PublishedMessage>, StoreError> {
    let sql = format!("SELECT {PUBLISHED_COLUMNS} FROM published WHERE status_name = ? ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(status.as_str())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(published_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_received_by_status(
    conn: &mut SqliteConnection,
    status: StatusName,
) -> Result<Vec<ReceivedMessage>, StoreError> {
    let sql = format!("SELECT {RECEIVED_COLUMNS} FROM received WHERE status_name = ? ORDER BY id");
    let rows = sqlx::query(&sql)
        .bind(status.as_str())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(received_from_row).collect()
}

#[instrument(skip_all)]
pub async fn first_published_with_status(
    conn: &mut SqliteConnection,
    status: StatusName,
) -> Result<Option<PublishedMessage>, StoreError> {
    let sql = format!(
        "SELECT {PUBLISHED_COLUMNS} FROM published WHERE status_name = ? ORDER BY id LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(status.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(published_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn first_received_with_status(
    conn: &mut SqliteConnection,
    status: StatusName,
) -> Result<Option<ReceivedMessage>, StoreError> {
    let sql = format!(
        "SELECT {RECEIVED_COLUMNS} FROM received WHERE status_name = ? ORDER BY id LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(status.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(received_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_published(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<PublishedMessage>, StoreError> {
    let sql = format!("SELECT {PUBLISHED_COLUMNS} FROM published WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(published_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_received(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<ReceivedMessage>, StoreError> {
    let sql = format!("SELECT {RECEIVED_COLUMNS} FROM received WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(received_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn insert_published(
    conn: &mut SqliteConnection,
    message: &NewPublishedMessage,
    added: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let res = sqlx::query(
        "INSERT INTO published (name, content, message_id, transaction_id, retries, added, expires_at, status_name) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message.name.as_str())
    .bind(message.content.as_str())
    .bind(message.message_id)
    .bind(message.transaction_id)
    .bind(message.retries)
    .bind(added)
    .bind::<Option<DateTime<Utc>>>(None)
    .bind(message.status_name.as_str())
    .execute(&mut *conn)
    .await?;
    expect_one("insert published message", res.rows_affected())?;
    Ok(res.last_insert_rowid())
}

/// Insert an inbox row, storing the envelope's inner payload and correlation ids.
#[instrument(skip_all)]
pub async fn insert_received(
    conn: &mut SqliteConnection,
    message: &NewReceivedMessage,
    envelope: &MessageEnvelope,
    added: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let res = sqlx::query(
        "INSERT INTO received (name, group_name, content, retries, added, expires_at, status_name, message_id, transaction_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message.name.as_str())
    .bind(message.group.as_deref())
    .bind(envelope.content.as_str())
    .bind(message.retries)
    .bind(added)
    .bind::<Option<DateTime<Utc>>>(None)
    .bind(message.status_name.as_str())
    .bind(envelope.meta_data.message_id)
    .bind(envelope.meta_data.transaction_id)
    .execute(&mut *conn)
    .await?;
    expect_one("insert received message", res.rows_affected())?;
    Ok(res.last_insert_rowid())
}

#[instrument(skip_all)]
pub async fn update_status(
    conn: &mut SqliteConnection,
    message_type: MessageType,
    id: i64,
    status: StatusName,
) -> Result<(), StoreError> {
    let sql = format!("UPDATE {} SET status_name = ? WHERE id = ?", message_type.table());
    let affected = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    expect_one("update status", affected)
}

/// Writes that report zero affected rows without a driver error are
/// integrity failures, not successes.
pub fn expect_one(op: &str, affected: u64) -> Result<(), StoreError> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::rows_affected(op, 1, affected))
    }
}

fn published_from_row(row: &SqliteRow) -> Result<PublishedMessage, StoreError> {
    let status: String = row.try_get("status_name")?;
    Ok(PublishedMessage {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        message_id: row.try_get("message_id")?,
        transaction_id: row.try_get("transaction_id")?,
        retries: row.try_get("retries")?,
        added: row.try_get("added")?,
        expires_at: row.try_get("expires_at")?,
        last_warned_time: row.try_get("last_warned_time")?,
        status_name: StatusName::parse_status(&status)?,
    })
}

fn received_from_row(row: &SqliteRow) -> Result<ReceivedMessage, StoreError> {
    let status: String = row.try_get("status_name")?;
    Ok(ReceivedMessage {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        group: row.try_get("group_name")?,
        content: row.try_get("content")?,
        message_id: row.try_get("message_id")?,
        transaction_id: row.try_get("transaction_id")?,
        retries: row.try_get("retries")?,
        added: row.try_get("added")?,
        expires_at: row.try_get("expires_at")?,
        last_warned_time: row.try_get("last_warned_time")?,
        status_name: StatusName::parse_status(&status)?,
    })
}
