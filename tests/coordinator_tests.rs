mod common;

use idempotency_engine::idempotency::{
    CoordinatorConfig, Decision, ExecuteRequest, ExecutionGrant, IdempotencyCoordinator, IdempotencyKey,
    InMemoryLeaseStore, InMemoryRecordStore, NormalizedRequest, OutcomeState, PublishOutcome, RecordState,
    RecordStore, ResultPublisher, StoredResponse,
};
use std::sync::Arc;
use std::time::Duration;

type Coordinator = IdempotencyCoordinator<InMemoryRecordStore, InMemoryLeaseStore>;
type Publisher = ResultPublisher<InMemoryRecordStore, InMemoryLeaseStore>;

fn setup(lease_ttl: Duration) -> (Arc<Coordinator>, Publisher, Arc<InMemoryRecordStore>) {
    let records = Arc::new(InMemoryRecordStore::new());
    let leases = Arc::new(InMemoryLeaseStore::new());
    let config = CoordinatorConfig {
        lease_ttl,
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(IdempotencyCoordinator::new(records.clone(), leases.clone(), config));
    let publisher = ResultPublisher::new(records.clone(), leases).without_renewal();
    (coordinator, publisher, records)
}

fn request(key: &str, body: &str) -> ExecuteRequest {
    ExecuteRequest::new(IdempotencyKey::new(key).unwrap(), common::order_request(body))
}

fn expect_grant(decision: Decision) -> ExecutionGrant {
    match decision {
        Decision::ExecuteNow(grant) => grant,
        other => panic!("expected ExecuteNow, got {:?}", other),
    }
}

fn expect_wait(decision: Decision) -> Duration {
    match decision {
        Decision::WaitOrRetry { retry_after } => retry_after,
        other => panic!("expected WaitOrRetry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_waits_then_replays() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));
    let body = r#"{"item":"book","qty":1}"#;

    let grant = expect_grant(coordinator.execute(&request("order-42", body)).await.unwrap());
    expect_wait(coordinator.execute(&request("order-42", body)).await.unwrap());

    let published = publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, br#"{"id":7}"#.to_vec()))
        .await
        .unwrap();
    assert!(matches!(published, PublishOutcome::Published(_)));

    match coordinator.execute(&request("order-42", body)).await.unwrap() {
        Decision::Replay(outcome) => {
            assert_eq!(outcome.state, OutcomeState::Completed);
            assert_eq!(outcome.response.status_code, 200);
            assert_eq!(outcome.response.body, br#"{"id":7}"#.to_vec());
        }
        other => panic!("expected Replay, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reused_key_with_different_request_conflicts() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));

    let grant = expect_grant(coordinator.execute(&request("order-42", r#"{"qty":1}"#)).await.unwrap());
    assert_eq!(
        coordinator.execute(&request("order-42", r#"{"qty":2}"#)).await.unwrap(),
        Decision::Conflict
    );

    publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, b"ok".to_vec()))
        .await
        .unwrap();

    assert_eq!(
        coordinator.execute(&request("order-42", r#"{"qty":2}"#)).await.unwrap(),
        Decision::Conflict
    );
}

#[tokio::test]
async fn test_equivalent_requests_share_a_fingerprint() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));

    let grant = expect_grant(
        coordinator
            .execute(&request("order-7", r#"{"a":1,"b":[1,2]}"#))
            .await
            .unwrap(),
    );
    publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(201, b"created".to_vec()))
        .await
        .unwrap();

    let reordered = ExecuteRequest::new(
        IdempotencyKey::new("order-7").unwrap(),
        NormalizedRequest::new("post", "/orders/", br#"{ "b": [1, 2], "a": 1 }"#.to_vec()),
    );
    assert!(matches!(coordinator.execute(&reordered).await.unwrap(), Decision::Replay(_)));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_is_taken_over_after_ttl() {
    let (coordinator, publisher, records) = setup(Duration::from_secs(5));
    let body = r#"{"amount":100}"#;

    // Holder A crashes after winning the lease.
    let crashed = expect_grant(coordinator.execute(&request("order-99", body)).await.unwrap());

    tokio::time::advance(Duration::from_secs(1)).await;
    let retry_after = expect_wait(
        coordinator
            .execute(&request("order-99", body).with_attempt(10))
            .await
            .unwrap(),
    );
    assert!(retry_after <= Duration::from_secs(4));

    tokio::time::advance(Duration::from_secs(5)).await;
    let takeover = expect_grant(coordinator.execute(&request("order-99", body)).await.unwrap());
    assert_ne!(takeover.token, crashed.token);

    // A wakes up late: its publish must not overwrite anything.
    let late = publisher
        .publish(&crashed, OutcomeState::Completed, StoredResponse::new(200, b"from-a".to_vec()))
        .await
        .unwrap();
    assert_eq!(late, PublishOutcome::LeaseLost);

    publisher
        .publish(&takeover, OutcomeState::Completed, StoredResponse::new(200, b"from-b".to_vec()))
        .await
        .unwrap();

    let stored = records.get_record(&takeover.key).await.unwrap().unwrap();
    assert_eq!(stored.state, RecordState::Completed);
    assert_eq!(stored.response.unwrap().body, b"from-b".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_grant_exactly_one_execution() {
    let (coordinator, _, records) = setup(Duration::from_secs(30));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            coordinator.execute(&request("order-burst", r#"{"qty":3}"#)).await
        }));
    }

    let mut granted = 0;
    let mut waiting = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Decision::ExecuteNow(_) => granted += 1,
            Decision::WaitOrRetry { .. } => waiting += 1,
            other => panic!("unexpected decision {:?}", other),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(waiting, 31);
    assert_eq!(records.len().await, 1);

    let stats = coordinator.stats().snapshot();
    assert_eq!(stats.total_requests, 32);
    assert_eq!(stats.executions_granted, 1);
}

#[tokio::test]
async fn test_failed_outcome_is_replayed() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));

    let grant = expect_grant(coordinator.execute(&request("order-declined", "{}")).await.unwrap());
    publisher
        .publish(
            &grant,
            OutcomeState::Failed,
            StoredResponse::new(402, br#"{"error":"card_declined"}"#.to_vec()),
        )
        .await
        .unwrap();

    match coordinator.execute(&request("order-declined", "{}")).await.unwrap() {
        Decision::Replay(outcome) => {
            assert_eq!(outcome.state, OutcomeState::Failed);
            assert_eq!(outcome.response.status_code, 402);
        }
        other => panic!("expected Replay, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replay_is_byte_exact() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));
    let body: Vec<u8> = (0u8..=255).collect();

    let grant = expect_grant(coordinator.execute(&request("binary-export", "")).await.unwrap());
    publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, body.clone()))
        .await
        .unwrap();

    for _ in 0..3 {
        match coordinator.execute(&request("binary-export", "null")).await.unwrap() {
            Decision::Replay(outcome) => assert_eq!(outcome.response.body, body),
            other => panic!("expected Replay, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_client_scoped_keys_do_not_collide() {
    let (coordinator, _, _) = setup(Duration::from_secs(30));

    for client in ["tenant-a", "tenant-b"] {
        let scoped = ExecuteRequest::new(
            IdempotencyKey::scoped(client, "order-1").unwrap(),
            common::order_request(r#"{"qty":1}"#),
        );
        expect_grant(coordinator.execute(&scoped).await.unwrap());
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_with_attempt() {
    let (coordinator, _, _) = setup(Duration::from_secs(30));
    expect_grant(coordinator.execute(&request("order-slow", "{}")).await.unwrap());

    let first = expect_wait(coordinator.execute(&request("order-slow", "{}")).await.unwrap());
    let third = expect_wait(
        coordinator
            .execute(&request("order-slow", "{}").with_attempt(2))
            .await
            .unwrap(),
    );
    assert_eq!(first, Duration::from_millis(100));
    assert_eq!(third, Duration::from_millis(400));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lease_acquire_is_exclusive() {
    use idempotency_engine::idempotency::{LeaseAcquisition, LeaseStore};

    let leases = Arc::new(InMemoryLeaseStore::new());
    let key = IdempotencyKey::new("lease-race").unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let leases = Arc::clone(&leases);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            leases.acquire(&key, Duration::from_secs(30)).await
        }));
    }

    let mut acquired = 0;
    for handle in handles {
        if let LeaseAcquisition::Acquired(_) = handle.await.unwrap().unwrap() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test]
async fn test_unscoped_key_cannot_read_scoped_record() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));
    let body = r#"{"qty":1}"#;

    let scoped = ExecuteRequest::new(
        IdempotencyKey::scoped("tenant-a", "order-42").unwrap(),
        common::order_request(body),
    );
    let grant = expect_grant(coordinator.execute(&scoped).await.unwrap());
    publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, b"tenant-a secret".to_vec()))
        .await
        .unwrap();

    assert!(IdempotencyKey::new("tenant-a:order-42").is_err());

    let other_tenant = ExecuteRequest::new(
        IdempotencyKey::scoped("tenant-b", "order-42").unwrap(),
        common::order_request(body),
    );
    expect_grant(coordinator.execute(&other_tenant).await.unwrap());
}

#[tokio::test]
async fn test_long_scoped_key_publishes_and_replays() {
    let (coordinator, publisher, _) = setup(Duration::from_secs(30));
    let key = IdempotencyKey::scoped(&"c".repeat(200), &"k".repeat(200)).unwrap();
    let long = || ExecuteRequest::new(key.clone(), common::order_request("{}"));

    let grant = expect_grant(coordinator.execute(&long()).await.unwrap());
    let published = publisher
        .publish(&grant, OutcomeState::Completed, StoredResponse::new(200, b"ok".to_vec()))
        .await
        .unwrap();
    assert!(matches!(published, PublishOutcome::Published(_)));

    match coordinator.execute(&long()).await.unwrap() {
        Decision::Replay(outcome) => assert_eq!(outcome.response.body, b"ok".to_vec()),
        other => panic!("expected Replay, got {:?}", other),
    }
}
