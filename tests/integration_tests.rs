//! Integration tests for redikit
//!
//! These tests require a running Redis instance.
//! Set REDIS_HOST / REDIS_PORT or use the default 127.0.0.1:6379.

use redikit::{Config, Redikit};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn test_config() -> Config {
    let config = {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379);
        Config::new(host, port).with_event_prefix("rdbtest")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.log.env_filter_directive())
            }),
        )
        .try_init();
    config
}

fn unique_key(label: &str) -> String {
    format!("redikit:test:{label}:{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn connect_reports_ready_clients() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");

    assert!(instance.is_client_connected("default").await);
    assert!(!instance.is_cluster());

    let summary = instance.ready_summary().await;
    assert!(summary.clients.iter().any(|c| c.name == "default"));
    assert!(summary.hooks.contains(&"pubsub".to_string()));

    let info = instance.host_info();
    assert_eq!(info.id, instance.id());
    assert!(info.process.pid > 0);

    instance.quit().await.expect("quit failed");
    instance.quit().await.expect("second quit failed");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn pubsub_round_trips_json_payloads() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");
    let pubsub = instance.pubsub().expect("pubsub not mounted");

    let channel = unique_key("roundtrip");
    let (tx, mut rx) = mpsc::unbounded_channel();
    pubsub
        .subscribe(channel.as_str(), Arc::new(move |msg| {
            let _ = tx.send(msg);
        }))
        .await
        .expect("subscribe failed");

    pubsub
        .publish(channel.as_str(), &serde_json::json!({"a": 1}))
        .await
        .expect("publish failed");

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("listener dropped");
    assert_eq!(msg.channel, channel);
    assert_eq!(msg.data, serde_json::json!({"a": 1}));
    assert!(!msg.timeout);

    instance.quit().await.expect("quit failed");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn subscribe_once_times_out_without_a_publish() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");
    let pubsub = instance.pubsub().expect("pubsub not mounted");

    let channel = unique_key("once-timeout");
    let (tx, mut rx) = mpsc::unbounded_channel();
    pubsub
        .subscribe_once(
            channel.as_str(),
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
            Some(Duration::from_millis(200)),
        )
        .await
        .expect("subscribe_once failed");

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the timeout marker")
        .expect("listener dropped");
    assert!(msg.timeout);
    assert_eq!(msg.timeout_period, Some(200));

    instance.quit().await.expect("quit failed");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn subscribe_once_of_first_channel_wins() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");
    let pubsub = instance.pubsub().expect("pubsub not mounted");

    let first = unique_key("group-a");
    let second = unique_key("group-b");
    let (tx, mut rx) = mpsc::unbounded_channel();
    pubsub
        .subscribe_once_of(
            vec![first.clone(), second.clone()],
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("subscribe_once_of failed");

    pubsub
        .publish(second.as_str(), "winner")
        .await
        .expect("publish failed");

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the winner")
        .expect("listener dropped");
    assert_eq!(msg.channel, second);
    assert!(!msg.timeout);

    // The whole group is released; another publish reaches nobody.
    pubsub
        .publish(first.as_str(), "late")
        .await
        .expect("publish failed");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err()
    );

    instance.quit().await.expect("quit failed");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn builtin_setnxex_sets_only_once() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");

    let key = unique_key("setnxex");
    let first = instance
        .run_command(
            "setnxex",
            &[key.clone()],
            &["5".to_string(), "value".to_string()],
        )
        .await
        .expect("first setnxex failed");
    assert_eq!(first, redis::Value::Int(1));

    let second = instance
        .run_command(
            "setnxex",
            &[key.clone()],
            &["5".to_string(), "other".to_string()],
        )
        .await
        .expect("second setnxex failed");
    assert_eq!(second, redis::Value::Int(0));

    instance.quit().await.expect("quit failed");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn define_command_applies_custom_scripts() {
    let instance = Redikit::connect(test_config())
        .await
        .expect("Failed to connect");

    let defined = instance
        .define_command(redikit::ScriptDefinition::new(
            "echoarg",
            0,
            "return ARGV[1]",
        ))
        .await
        .expect("define_command failed");
    assert!(defined);

    let reply = instance
        .run_command("echoarg", &[], &["hello".to_string()])
        .await
        .expect("echoarg failed");
    assert_eq!(reply, redis::Value::BulkString(b"hello".to_vec()));

    instance.quit().await.expect("quit failed");
}
