mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use objgate::config::Settings;
use objgate::gateway::{ConnectionError, RateLimitError};
use objgate::{Gateway, GatewayError};
use support::{EchoInvoker, MockFactory, StaticAuth};

fn gateway(settings: &Settings) -> (Gateway<MockFactory>, MockFactory) {
    let factory = MockFactory::new();
    let gateway = Gateway::new(settings, factory.clone(), Arc::new(StaticAuth));
    (gateway, factory)
}

#[tokio::test]
async fn login_call_logout() {
    let (gateway, _) = gateway(&support::settings());
    let invoker = EchoInvoker::default();

    let session = gateway.login(&support::alice()).await.unwrap();
    let result = gateway
        .call(&session.id, "res.partner.write", &json!([[1], {"name": "x"}]), false, &invoker)
        .await
        .unwrap();
    assert_eq!(result["principal_id"], 7);
    assert_eq!(result["operation"], "res.partner.write");

    assert!(gateway.logout(&session.id));
    assert!(!gateway.logout(&session.id));

    let err = gateway
        .call(&session.id, "res.partner.read", &json!([1]), true, &invoker)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Session { .. }));
    assert_eq!(invoker.calls(), 1);
}

#[tokio::test]
async fn read_only_calls_are_cached_by_canonical_args() {
    let (gateway, factory) = gateway(&support::settings());
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    let first = gateway
        .call(&session.id, "search_read", &json!({"a": 1, "b": 2}), true, &invoker)
        .await
        .unwrap();
    let second = gateway
        .call(&session.id, "search_read", &json!({"b": 2, "a": 1}), true, &invoker)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(invoker.calls(), 1);
    assert_eq!(factory.backend.opened(), 1);
    assert_eq!(gateway.stats().cache.hits, 1);
}

#[tokio::test]
async fn cached_reads_are_not_shared_between_principals() {
    let (gateway, _) = gateway(&support::settings());
    let invoker = EchoInvoker::default();
    let alice = gateway.login(&support::alice()).await.unwrap();
    let bob = gateway.login(&support::bob()).await.unwrap();

    let for_alice = gateway
        .call(&alice.id, "res.partner.read", &json!([1]), true, &invoker)
        .await
        .unwrap();
    let for_bob = gateway
        .call(&bob.id, "res.partner.read", &json!([1]), true, &invoker)
        .await
        .unwrap();

    assert_eq!(for_alice["principal_id"], 7);
    assert_eq!(for_bob["principal_id"], 8);
    assert_eq!(invoker.calls(), 2);

    // Each principal still hits its own entry.
    let again = gateway
        .call(&bob.id, "res.partner.read", &json!([1]), true, &invoker)
        .await
        .unwrap();
    assert_eq!(again["principal_id"], 8);
    assert_eq!(invoker.calls(), 2);
}

#[tokio::test]
async fn cache_hit_needs_no_connection() {
    let mut settings = support::settings();
    settings.pool.max_size = 1;
    settings.pool.acquire_timeout = Duration::from_millis(50);
    let (gateway, _) = gateway(&settings);
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    gateway
        .call(&session.id, "read", &json!([1]), true, &invoker)
        .await
        .unwrap();

    // With the only connection leased, a hit still answers.
    let _held = gateway.pool().acquire().await.unwrap();
    gateway
        .call(&session.id, "read", &json!([1]), true, &invoker)
        .await
        .unwrap();

    let err = gateway
        .call(&session.id, "read", &json!([2]), true, &invoker)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn writes_bypass_the_cache() {
    let (gateway, _) = gateway(&support::settings());
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    for _ in 0..3 {
        gateway
            .call(&session.id, "create", &json!({"name": "x"}), false, &invoker)
            .await
            .unwrap();
    }
    assert_eq!(invoker.calls(), 3);
    assert!(gateway.cache().is_empty());
}

#[tokio::test]
async fn zero_ttl_disables_caching() {
    let mut settings = support::settings();
    settings.cache.default_ttl = Duration::ZERO;
    let (gateway, _) = gateway(&settings);
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    for _ in 0..2 {
        gateway
            .call(&session.id, "read", &json!([1]), true, &invoker)
            .await
            .unwrap();
    }
    assert_eq!(invoker.calls(), 2);
}

#[tokio::test]
async fn transport_failure_discards_the_connection() {
    let (gateway, factory) = gateway(&support::settings());
    let invoker = EchoInvoker::default();
    invoker.fail_transport.store(true, Ordering::SeqCst);
    let session = gateway.login(&support::alice()).await.unwrap();

    let err = gateway
        .call(&session.id, "read", &json!([1]), true, &invoker)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Backend { ref operation, .. } if operation == "read"));

    let stats = gateway.stats();
    assert_eq!(stats.pool.active, 0);
    assert_eq!(factory.backend.closed(), 1);
    assert!(gateway.cache().is_empty());

    invoker.fail_transport.store(false, Ordering::SeqCst);
    gateway
        .call(&session.id, "read", &json!([1]), true, &invoker)
        .await
        .unwrap();
    assert_eq!(factory.backend.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn non_blocking_limiter_rejects_over_budget_calls() {
    let mut settings = support::settings();
    settings.rate_limit.requests_per_minute = 60;
    settings.rate_limit.burst = Some(1);
    settings.rate_limit.block = false;
    let (gateway, _) = gateway(&settings);
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap();
    let err = gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::RateLimit(RateLimitError::Exceeded { .. })
    ));
    assert_eq!(invoker.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn blocking_limiter_gives_up_at_acquire_timeout() {
    let mut settings = support::settings();
    settings.rate_limit.requests_per_minute = 1;
    settings.rate_limit.burst = Some(1);
    settings.pool.acquire_timeout = Duration::from_millis(100);
    let (gateway, _) = gateway(&settings);
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap();
    let err = gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_connection_error());
}

#[tokio::test]
async fn bad_credentials_do_not_create_sessions() {
    let (gateway, _) = gateway(&support::settings());

    let err = gateway
        .login(&objgate::Credentials::new("alice", "nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Auth { .. }));
    assert_eq!(gateway.stats().sessions, 0);
}

#[tokio::test]
async fn warm_opens_min_idle_connections() {
    let mut settings = support::settings();
    settings.pool.min_idle = 2;
    let (gateway, factory) = gateway(&settings);

    assert_eq!(gateway.warm().await, 2);
    assert_eq!(gateway.stats().pool.idle, 2);
    assert_eq!(factory.backend.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_sweeper_purges_in_background() {
    let mut settings = support::settings();
    settings.cache.default_ttl = Duration::from_millis(50);
    settings.cache.sweep_interval = Some(Duration::from_millis(100));
    let (gateway, _) = gateway(&settings);
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    gateway
        .call(&session.id, "read", &json!([1]), true, &invoker)
        .await
        .unwrap();
    assert_eq!(gateway.cache().len(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(gateway.cache().is_empty());

    gateway.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_pool() {
    let (gateway, factory) = gateway(&support::settings());
    let invoker = EchoInvoker::default();
    let session = gateway.login(&support::alice()).await.unwrap();

    gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap();
    assert_eq!(gateway.stats().pool.idle, 1);

    gateway.shutdown().await;
    assert_eq!(factory.backend.closed(), 1);
    assert!(gateway.stats().pool.closed);

    let err = gateway
        .call(&session.id, "create", &json!({}), false, &invoker)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Connection(ConnectionError::PoolClosed { .. })
    ));
}
