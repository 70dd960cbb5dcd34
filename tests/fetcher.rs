use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use txqueue::db::{self, ConnectionProvider, SqliteConnectionProvider};
use txqueue::{
    Bookkeeper, LeaseConfig, LeaseState, MessageType, NewReceivedMessage, QueueFetcher, StatusName,
    StoreError,
};

fn open(url: &str, busy_timeout: Duration) -> Arc<dyn ConnectionProvider> {
    Arc::new(SqliteConnectionProvider::from_url(url, busy_timeout).unwrap())
}

async fn setup() -> (TempDir, String, Arc<dyn ConnectionProvider>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());
    let provider = open(&url, Duration::from_secs(10));
    db::run_migrations(provider.as_ref()).await.unwrap();
    (dir, url, provider)
}

async fn push(provider: &dyn ConnectionProvider, message_id: i64, message_type: i64) {
    let mut conn = provider.open_connection().await.unwrap();
    sqlx::query("INSERT INTO queue (message_id, message_type) VALUES (?, ?)")
        .bind(message_id)
        .bind(message_type)
        .execute(&mut conn)
        .await
        .unwrap();
}

async fn queue_len(provider: &dyn ConnectionProvider) -> i64 {
    let mut conn = provider.open_connection().await.unwrap();
    sqlx::query_scalar("SELECT COUNT(*) FROM queue")
        .fetch_one(&mut conn)
        .await
        .unwrap()
}

#[tokio::test]
async fn empty_queue_is_not_an_error() {
    let (_dir, _url, provider) = setup().await;
    let fetcher = QueueFetcher::new(provider, LeaseConfig::default());
    assert!(fetcher.fetch_next().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_row() {
    let (_dir, _url, provider) = setup().await;
    for id in 1..=3 {
        push(provider.as_ref(), id, 0).await;
    }
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    // Every lease stays open until all eight claimants have returned.
    let handles = (0..8).map(|_| {
        let fetcher = fetcher.clone();
        tokio::spawn(async move { fetcher.fetch_next().await.unwrap() })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), 5);

    let mut leases: Vec<_> = results.into_iter().flatten().collect();
    let mut claimed: Vec<i64> = leases.iter().map(|l| l.message_id()).collect();
    claimed.sort();
    assert_eq!(claimed, vec![1, 2, 3]);
    assert!(fetcher.fetch_next().await.unwrap().is_none());

    for lease in &mut leases {
        lease.acknowledge().await.unwrap();
        lease.dispose().await.unwrap();
    }
    assert_eq!(queue_len(provider.as_ref()).await, 0);
}

#[tokio::test]
async fn acknowledged_claim_survives_reopen() {
    let (_dir, url, provider) = setup().await;
    push(provider.as_ref(), 11, 0).await;
    push(provider.as_ref(), 12, 1).await;

    let fetcher = QueueFetcher::new(provider, LeaseConfig::default());
    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(lease.identity(), (11, MessageType::Published));
    lease.acknowledge().await.unwrap();
    lease.dispose().await.unwrap();
    drop(fetcher);

    let reopened = open(&url, Duration::from_secs(10));
    assert_eq!(queue_len(reopened.as_ref()).await, 1);
    let fetcher = QueueFetcher::new(reopened, LeaseConfig::default());
    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(lease.identity(), (12, MessageType::Received));
    lease.abandon().await.unwrap();
    lease.dispose().await.unwrap();
}

#[tokio::test]
async fn abandoned_claim_is_visible_again() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 5, 1).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    lease.abandon().await.unwrap();
    assert_eq!(lease.state().await, LeaseState::RolledBack);
    lease.dispose().await.unwrap();
    assert_eq!(queue_len(provider.as_ref()).await, 1);

    let mut again = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(again.identity(), (5, MessageType::Received));
    again.acknowledge().await.unwrap();
    again.dispose().await.unwrap();
    assert!(fetcher.fetch_next().await.unwrap().is_none());
}

#[tokio::test]
async fn second_acknowledge_is_rejected() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 3, 0).await;
    push(provider.as_ref(), 4, 0).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    lease.acknowledge().await.unwrap();
    let err = lease.acknowledge().await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Settlement { message_id: 3, state: LeaseState::Committed }
    ));
    lease.dispose().await.unwrap();

    assert_eq!(queue_len(provider.as_ref()).await, 1);
}

#[tokio::test]
async fn disposing_unsettled_lease_requeues() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 8, 0).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    lease.dispose().await.unwrap();
    assert_eq!(queue_len(provider.as_ref()).await, 1);
    assert!(matches!(
        lease.acknowledge().await,
        Err(StoreError::Settlement { state: LeaseState::Disposed, .. })
    ));

    let mut again = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(again.message_id(), 8);
    again.acknowledge().await.unwrap();
    again.dispose().await.unwrap();
}

#[tokio::test]
async fn open_leases_do_not_block_claimants_or_writers() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 1, 0).await;
    push(provider.as_ref(), 2, 0).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());
    let bookkeeper = Bookkeeper::new(Arc::clone(&provider));

    let mut first = fetcher.fetch_next().await.unwrap().unwrap();
    let mut second = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(first.message_id(), 1);
    assert_eq!(second.message_id(), 2);
    assert!(fetcher.fetch_next().await.unwrap().is_none());

    let stored = bookkeeper
        .store_received(&NewReceivedMessage {
            name: "order.created".into(),
            group: None,
            content: r#"{"content": "X", "metaData": {"messageId": 3, "transactionId": 1}}"#.into(),
            retries: 0,
            status_name: StatusName::Scheduled,
        })
        .await
        .unwrap();
    bookkeeper
        .enqueue(MessageType::Received, stored)
        .await
        .unwrap();

    let mut third = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(third.identity(), (stored, MessageType::Received));

    second.abandon().await.unwrap();
    for lease in [&mut first, &mut third] {
        lease.acknowledge().await.unwrap();
        lease.dispose().await.unwrap();
    }
    second.dispose().await.unwrap();
    assert_eq!(queue_len(provider.as_ref()).await, 1);
}

#[tokio::test]
async fn locked_store_reads_as_empty() {
    let (_dir, url, provider) = setup().await;
    push(provider.as_ref(), 1, 0).await;
    let impatient = QueueFetcher::new(
        open(&url, Duration::from_millis(50)),
        LeaseConfig::default(),
    );

    let mut writer = provider.open_connection().await.unwrap();
    provider.begin_transaction(&mut writer).await.unwrap();
    assert!(impatient.fetch_next().await.unwrap().is_none());
    db::rollback_and_release(writer).await;

    let mut lease = impatient.fetch_next().await.unwrap().unwrap();
    assert_eq!(lease.message_id(), 1);
    lease.acknowledge().await.unwrap();
    lease.dispose().await.unwrap();
}

#[tokio::test]
async fn stale_claim_is_taken_over() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 4, 1).await;
    let patient = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());
    let hasty = QueueFetcher::new(
        Arc::clone(&provider),
        LeaseConfig {
            claim_timeout: Duration::from_millis(1),
            ..LeaseConfig::default()
        },
    );

    let mut stale = patient.fetch_next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut fresh = hasty.fetch_next().await.unwrap().unwrap();
    assert_eq!(fresh.identity(), (4, MessageType::Received));

    assert!(matches!(
        stale.acknowledge().await,
        Err(StoreError::ClaimLost { .. })
    ));
    assert_eq!(stale.state().await, LeaseState::Active);
    stale.dispose().await.unwrap();

    fresh.acknowledge().await.unwrap();
    fresh.dispose().await.unwrap();
    assert_eq!(queue_len(provider.as_ref()).await, 0);
}

#[tokio::test]
async fn kept_alive_claim_is_not_taken_over() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 6, 0).await;
    let config = LeaseConfig {
        keep_alive_interval: Duration::from_millis(50),
        claim_timeout: Duration::from_millis(400),
    };
    let fetcher = QueueFetcher::new(Arc::clone(&provider), config);

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(fetcher.fetch_next().await.unwrap().is_none());

    lease.acknowledge().await.unwrap();
    lease.dispose().await.unwrap();
}

#[tokio::test]
async fn sentinel_row_is_discarded_as_empty() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 0, 0).await;
    push(provider.as_ref(), 9, 1).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    assert!(fetcher.fetch_next().await.unwrap().is_none());
    assert_eq!(queue_len(provider.as_ref()).await, 1);

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(lease.identity(), (9, MessageType::Received));
    lease.acknowledge().await.unwrap();
    lease.dispose().await.unwrap();
}

#[tokio::test]
async fn unknown_message_type_is_discarded_and_surfaced() {
    let (_dir, _url, provider) = setup().await;
    push(provider.as_ref(), 6, 5).await;
    push(provider.as_ref(), 9, 1).await;
    let fetcher = QueueFetcher::new(Arc::clone(&provider), LeaseConfig::default());

    assert!(matches!(
        fetcher.fetch_next().await,
        Err(StoreError::UnknownMessageType(5))
    ));
    assert_eq!(queue_len(provider.as_ref()).await, 1);

    let mut lease = fetcher.fetch_next().await.unwrap().unwrap();
    assert_eq!(lease.identity(), (9, MessageType::Received));
    lease.acknowledge().await.unwrap();
    lease.dispose().await.unwrap();
}
