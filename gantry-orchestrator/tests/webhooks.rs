mod common;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_core::domain::webhook::{DeliveryResult, WebhookScope, WebhookTrigger};
use gantry_core::dto::webhook::CreateWebhook;
use gantry_orchestrator::webhook::signature;

use common::{BUILD_LINT_DEPLOY, REPO, TestEnv, add_commit, env_with, test_config};

/// Answers with the scripted statuses in order, then 200; records requests
#[derive(Clone, Default)]
struct Receiver {
    script: Arc<Mutex<VecDeque<StatusCode>>>,
    received: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

async fn hook(State(receiver): State<Receiver>, headers: HeaderMap, body: Bytes) -> StatusCode {
    receiver.received.lock().unwrap().push((headers, body));
    receiver
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

async fn serve(script: &[StatusCode]) -> (String, Receiver) {
    let receiver = Receiver::default();
    receiver.script.lock().unwrap().extend(script.iter().copied());

    let router = Router::new()
        .route("/hook", post(hook))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/hook", addr), receiver)
}

async fn setup(url: &str) -> (TestEnv, uuid::Uuid) {
    let mut config = test_config();
    config.webhook.allow_loopback = true;
    let env = env_with(config, BUILD_LINT_DEPLOY).await;
    add_commit(&env.git, "abc", "feat", BUILD_LINT_DEPLOY, &[]);
    let webhook_id = create_webhook(&env, "ci-bot", url).await;
    (env, webhook_id)
}

async fn create_webhook(env: &TestEnv, name: &str, url: &str) -> uuid::Uuid {
    env.app
        .webhooks
        .create(CreateWebhook {
            scope: WebhookScope::Repository(REPO.to_string()),
            display_name: name.to_string(),
            url: url.to_string(),
            secret: "s3cret".to_string(),
            triggers: vec![WebhookTrigger::BranchUpdated],
            enabled: true,
        })
        .await
        .unwrap()
        .id
}

/// Runs retry passes, moving the clock past every backoff
async fn settle(env: &TestEnv) {
    for _ in 0..5 {
        env.clock.advance(Duration::from_secs(1));
        env.app.dispatcher.retry_due().await.unwrap();
    }
}

/// The commit each received body announces
fn pushed_commits(receiver: &Receiver) -> Vec<String> {
    receiver
        .received
        .lock()
        .unwrap()
        .iter()
        .map(|(_, body)| {
            let body: serde_json::Value = serde_json::from_slice(body).unwrap();
            body["payload"]["after"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let (url, receiver) = serve(&[
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::SERVICE_UNAVAILABLE,
    ])
    .await;
    let (env, webhook_id) = setup(&url).await;

    env.push("main", Some("c0ffee"), "abc").await;
    env.app.drain_events().await.unwrap();
    assert_eq!(receiver.received.lock().unwrap().len(), 1);
    settle(&env).await;

    let mut deliveries = env.app.webhooks.deliveries(webhook_id, 10).await.unwrap();
    deliveries.sort_by_key(|d| d.attempt);
    assert_eq!(deliveries.len(), 3);
    assert_eq!(
        deliveries.iter().map(|d| d.result).collect::<Vec<_>>(),
        vec![
            DeliveryResult::RetriableError,
            DeliveryResult::RetriableError,
            DeliveryResult::Success
        ]
    );
    assert_eq!(deliveries.iter().map(|d| d.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(deliveries.iter().all(|d| d.chain_id == deliveries[0].chain_id));
    assert!(deliveries[0].next_retry_at.is_some());
    assert!(deliveries[2].next_retry_at.is_none());
    assert_eq!(deliveries[0].response_status, Some(503));

    let received = receiver.received.lock().unwrap();
    assert_eq!(received.len(), 3);
    let (headers, body) = &received[2];
    assert_eq!(headers["x-gantry-trigger"], "branch_updated");
    let sig = headers[signature::HEADER].to_str().unwrap();
    assert!(signature::verify("s3cret", body, sig));

    // Replaying the event does not deliver again
    drop(received);
    let events = env
        .app
        .bus
        .read(gantry_core::domain::event::streams::GIT, 0, 10)
        .await
        .unwrap();
    assert_eq!(env.app.dispatcher.dispatch(&events[0]).await.unwrap(), 0);
    assert_eq!(receiver.received.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_retries_stop_at_the_attempt_ceiling() {
    let (url, receiver) = serve(&[StatusCode::BAD_GATEWAY; 5]).await;
    let (env, webhook_id) = setup(&url).await;

    env.push("main", Some("c0ffee"), "abc").await;
    env.app.drain_events().await.unwrap();
    settle(&env).await;

    let deliveries = env.app.webhooks.deliveries(webhook_id, 10).await.unwrap();
    assert_eq!(deliveries.len(), 3);
    assert!(deliveries.iter().all(|d| d.result == DeliveryResult::RetriableError));
    assert_eq!(receiver.received.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_failing_endpoint_keeps_order_without_delaying_others() {
    let (flaky_url, flaky) = serve(&[
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::SERVICE_UNAVAILABLE,
    ])
    .await;
    let (healthy_url, healthy) = serve(&[]).await;
    let (env, flaky_id) = setup(&flaky_url).await;
    create_webhook(&env, "dashboard", &healthy_url).await;
    add_commit(&env.git, "def", "fix", BUILD_LINT_DEPLOY, &[]);

    env.push("main", Some("c0ffee"), "abc").await;
    env.push("main", Some("abc"), "def").await;
    env.app.drain_events().await.unwrap();

    // Both events reach the healthy endpoint before any retry ran
    assert_eq!(pushed_commits(&healthy), vec!["abc", "def"]);
    assert_eq!(pushed_commits(&flaky), vec!["abc"]);
    let mut waiting = env.app.webhooks.deliveries(flaky_id, 10).await.unwrap();
    waiting.sort_by_key(|d| d.attempt);
    assert_eq!(
        waiting.iter().map(|d| (d.attempt, d.result)).collect::<Vec<_>>(),
        vec![(0, DeliveryResult::Queued), (1, DeliveryResult::RetriableError)]
    );

    settle(&env).await;
    assert_eq!(pushed_commits(&flaky), vec!["abc", "abc", "abc", "def"]);
    assert_eq!(pushed_commits(&healthy), vec!["abc", "def"]);

    let deliveries = env.app.webhooks.deliveries(flaky_id, 10).await.unwrap();
    let settled: Vec<_> = deliveries
        .iter()
        .filter(|d| d.result == DeliveryResult::Success)
        .collect();
    assert_eq!(settled.len(), 2);
    assert_eq!(env.app.dispatcher.retry_due().await.unwrap(), 0);
}

#[tokio::test]
async fn test_client_error_is_final_and_can_be_retriggered() {
    let (url, receiver) = serve(&[StatusCode::BAD_REQUEST]).await;
    let (env, webhook_id) = setup(&url).await;

    env.push("main", Some("c0ffee"), "abc").await;
    env.app.drain_events().await.unwrap();

    let deliveries = env.app.webhooks.deliveries(webhook_id, 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].result, DeliveryResult::FatalError);

    let retried = env.app.webhooks.retrigger(deliveries[0].id).await.unwrap();
    assert_eq!(retried.result, DeliveryResult::Success);
    assert_eq!(retried.retrigger_of, Some(deliveries[0].id));
    assert_ne!(retried.chain_id, deliveries[0].chain_id);
    assert_eq!(retried.request_body, deliveries[0].request_body);

    let received = receiver.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].1, received[1].1);
}

#[tokio::test]
async fn test_unsubscribed_kinds_are_not_delivered() {
    let (url, receiver) = serve(&[]).await;
    let (env, webhook_id) = setup(&url).await;

    // A tag push is not among the subscribed triggers
    env.app
        .bus
        .publish_json(
            gantry_core::domain::event::streams::GIT,
            REPO,
            &gantry_core::domain::event::GitEvent {
                repo_id: REPO.to_string(),
                kind: gantry_core::domain::event::GitEventKind::TagCreated,
                ref_name: "refs/tags/v1".to_string(),
                before: None,
                after: "abc".to_string(),
                principal: None,
            },
        )
        .await
        .unwrap();
    env.app.drain_events().await.unwrap();

    assert!(env.app.webhooks.deliveries(webhook_id, 10).await.unwrap().is_empty());
    assert!(receiver.received.lock().unwrap().is_empty());
}
