//! Webhook Dispatcher
//!
//! Consumes the `git`, `pullreq` and `execution` streams as the `webhooks`
//! group and makes the first attempt for every subscribed webhook in
//! parallel. A failed attempt that is worth retrying records its
//! `next_retry_at`; the retry pass picks it up later, so one failing
//! endpoint never holds up the consumer.
//!
//! A webhook sees its events in stream order: while one of its chains still
//! has a planned attempt, new events are recorded as `queued` behind it and
//! the retry pass works through them oldest first.
//!
//! Each attempt is appended to the delivery history. Retries of one logical
//! delivery share a chain id, which is also sent as `X-Gantry-Delivery`.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::domain::event::{
    Event, EventPosition, ExecutionEvent, GitEvent, PullReqEvent, streams,
};
use gantry_core::domain::webhook::{DeliveryResult, Webhook, WebhookDelivery, WebhookTrigger};

use super::signature;
use crate::bus::consumer::{EventHandler, backoff};
use crate::clock::{SharedClock, to_chrono};
use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use crate::lock::{LockError, LockManager};
use crate::repository::WebhookRepository;

const RETRY_LOCK_LEASE: Duration = Duration::from_secs(30);

/// What a webhook receives for one event
#[derive(Debug, Clone)]
pub struct Envelope {
    pub trigger: WebhookTrigger,
    pub repo_id: String,
    /// Set for execution events, which also reach pipeline-scoped webhooks
    pub pipeline_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Maps a bus event; `None` for events webhooks never see
    pub fn from_event(event: &Event) -> Result<Option<Self>> {
        let envelope = match event.stream.as_str() {
            streams::GIT => {
                let git: GitEvent = event.decode()?;
                Envelope {
                    trigger: WebhookTrigger::from_git(git.kind),
                    repo_id: git.repo_id.clone(),
                    pipeline_id: None,
                    payload: serde_json::to_value(&git)?,
                }
            }
            streams::PULLREQ => {
                let pr: PullReqEvent = event.decode()?;
                Envelope {
                    trigger: WebhookTrigger::from_pullreq(pr.kind),
                    repo_id: pr.repo_id.clone(),
                    pipeline_id: None,
                    payload: serde_json::to_value(&pr)?,
                }
            }
            streams::EXECUTION => {
                let ev: ExecutionEvent = event.decode()?;
                let Some(trigger) = WebhookTrigger::from_execution(ev.kind) else {
                    return Ok(None);
                };
                Envelope {
                    trigger,
                    repo_id: ev.execution.repo_id.clone(),
                    pipeline_id: Some(ev.execution.pipeline_id),
                    payload: serde_json::to_value(&ev.execution)?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(envelope))
    }
}

/// One logical delivery, possibly spanning several attempts
struct Chain {
    id: Uuid,
    trigger: WebhookTrigger,
    event: Option<EventPosition>,
    retrigger_of: Option<Uuid>,
    body: String,
}

impl Chain {
    fn resume(last: &WebhookDelivery) -> Self {
        Self {
            id: last.chain_id,
            trigger: last.trigger,
            event: last.event.clone(),
            retrigger_of: last.retrigger_of,
            body: last.request_body.clone(),
        }
    }
}

struct AttemptOutcome {
    result: DeliveryResult,
    status: Option<u16>,
    body: Option<String>,
    error: Option<String>,
    duration_ms: u64,
}

pub struct WebhookDispatcher {
    webhooks: Arc<dyn WebhookRepository>,
    locks: LockManager,
    client: Client,
    clock: SharedClock,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(
        webhooks: Arc<dyn WebhookRepository>,
        locks: LockManager,
        clock: SharedClock,
        config: WebhookConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Validation(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            webhooks,
            locks,
            client,
            clock,
            config,
        })
    }

    /// Delivers one event to every subscribed webhook
    pub async fn dispatch(&self, event: &Event) -> Result<usize> {
        let Some(envelope) = Envelope::from_event(event)? else {
            return Ok(0);
        };
        let targets: Vec<Webhook> = self
            .webhooks
            .list_targets(&envelope.repo_id, envelope.pipeline_id)
            .await?
            .into_iter()
            .filter(|w| w.enabled && w.subscribes_to(envelope.trigger))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let position = event.position();
        let results = join_all(
            targets
                .iter()
                .map(|webhook| self.deliver_event(webhook, &position, &envelope)),
        )
        .await;

        let mut delivered = 0;
        for result in results {
            if result? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Starts the chain of one webhook for one event. Returns whether an
    /// attempt was made.
    async fn deliver_event(
        &self,
        webhook: &Webhook,
        position: &EventPosition,
        envelope: &Envelope,
    ) -> Result<bool> {
        let history = self
            .webhooks
            .list_deliveries_for_event(webhook.id, position)
            .await?;
        if !history.is_empty() {
            // Replayed event; open chains are continued by the retry pass
            debug!(webhook_id = %webhook.id, event = %position, "Delivery already recorded");
            return Ok(false);
        }

        let chain = Chain {
            id: Uuid::new_v4(),
            trigger: envelope.trigger,
            event: Some(position.clone()),
            retrigger_of: None,
            body: self.body(envelope)?,
        };
        if self.webhooks.has_open_deliveries(webhook.id).await? {
            self.queue(webhook, &chain).await?;
            return Ok(false);
        }
        self.attempt_once(webhook, &chain, 1).await?;
        Ok(true)
    }

    /// Re-sends a recorded delivery as a new chain
    pub async fn retrigger(&self, webhook: &Webhook, original: &WebhookDelivery) -> Result<WebhookDelivery> {
        let chain = Chain {
            id: Uuid::new_v4(),
            trigger: original.trigger,
            event: None,
            retrigger_of: Some(original.id),
            body: original.request_body.clone(),
        };
        info!(webhook_id = %webhook.id, delivery_id = %original.id, "Retriggering delivery");
        self.attempt_once(webhook, &chain, 1).await
    }

    /// Makes every attempt that is due, webhook by webhook in parallel and
    /// oldest chain first within a webhook. Returns the number of attempts.
    pub async fn retry_due(&self) -> Result<usize> {
        let open = self
            .webhooks
            .list_open_deliveries(self.config.retry_batch)
            .await?;

        let mut lanes: Vec<(Uuid, Vec<WebhookDelivery>)> = Vec::new();
        for delivery in open {
            match lanes.iter_mut().find(|(id, _)| *id == delivery.webhook_id) {
                Some((_, lane)) => lane.push(delivery),
                None => lanes.push((delivery.webhook_id, vec![delivery])),
            }
        }

        let results = join_all(
            lanes
                .into_iter()
                .map(|(webhook_id, lane)| self.drain_lane(webhook_id, lane)),
        )
        .await;
        let mut attempts = 0;
        for result in results {
            attempts += result?;
        }
        Ok(attempts)
    }

    async fn drain_lane(&self, webhook_id: Uuid, lane: Vec<WebhookDelivery>) -> Result<usize> {
        let Some(webhook) = self.webhooks.find_by_id(webhook_id).await? else {
            return Ok(0);
        };
        if !webhook.enabled {
            return Ok(0);
        }

        let mut attempts = 0;
        for last in lane {
            if last.next_retry_at.is_some_and(|at| at > self.clock.now()) {
                break;
            }
            let record = self
                .attempt_once(&webhook, &Chain::resume(&last), last.attempt + 1)
                .await?;
            attempts += 1;
            if record.next_retry_at.is_some() {
                break;
            }
        }
        Ok(attempts)
    }

    /// Runs retry passes until shutdown; one instance at a time
    pub async fn run_retries(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Webhook retry loop started");
        let key = LockManager::key("webhooks", "retry");
        loop {
            match self.locks.hold(&key, RETRY_LOCK_LEASE).await {
                Ok(held) => {
                    match self.retry_due().await {
                        Ok(0) => {}
                        Ok(attempts) => debug!(attempts, "Webhook retry pass finished"),
                        Err(e) => warn!(error = %e, "Webhook retry pass failed"),
                    }
                    if let Err(e) = held.release().await {
                        debug!(error = %e, "Webhook retry lock release failed");
                    }
                }
                Err(LockError::Busy(_)) => debug!("Webhook retries running elsewhere"),
                Err(e) => warn!(error = %e, "Could not take the webhook retry lock"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Webhook retry loop stopped");
    }

    /// Records an event that waits behind an earlier delivery
    async fn queue(&self, webhook: &Webhook, chain: &Chain) -> Result<()> {
        let now = self.clock.now();
        let record = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            chain_id: chain.id,
            attempt: 0,
            trigger: chain.trigger,
            event: chain.event.clone(),
            retrigger_of: chain.retrigger_of,
            request_body: chain.body.clone(),
            result: DeliveryResult::Queued,
            response_status: None,
            response_body: None,
            error: None,
            duration_ms: 0,
            next_retry_at: Some(now),
            created_at: now,
        };
        self.webhooks.append_delivery(&record).await?;
        debug!(webhook_id = %webhook.id, chain_id = %chain.id, "Delivery queued behind an open chain");
        Ok(())
    }

    async fn attempt_once(&self, webhook: &Webhook, chain: &Chain, attempt: u32) -> Result<WebhookDelivery> {
        let outcome = self.attempt(webhook, chain).await;
        let retry =
            outcome.result == DeliveryResult::RetriableError && attempt < self.config.max_attempts;
        let delay = backoff(self.config.backoff_base, self.config.backoff_max, attempt);
        let now = self.clock.now();

        let record = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            chain_id: chain.id,
            attempt,
            trigger: chain.trigger,
            event: chain.event.clone(),
            retrigger_of: chain.retrigger_of,
            request_body: chain.body.clone(),
            result: outcome.result,
            response_status: outcome.status,
            response_body: outcome.body,
            error: outcome.error,
            duration_ms: outcome.duration_ms,
            next_retry_at: retry.then(|| now + to_chrono(delay)),
            created_at: now,
        };
        self.webhooks.append_delivery(&record).await?;

        match record.result {
            DeliveryResult::Success => {
                debug!(webhook_id = %webhook.id, attempt, "Webhook delivered");
            }
            _ if retry => {
                warn!(
                    webhook_id = %webhook.id,
                    attempt,
                    status = ?record.response_status,
                    error = ?record.error,
                    "Webhook delivery failed, retry planned"
                );
            }
            _ => {
                warn!(
                    webhook_id = %webhook.id,
                    attempt,
                    result = record.result.as_str(),
                    status = ?record.response_status,
                    "Webhook delivery gave up"
                );
            }
        }
        Ok(record)
    }

    async fn attempt(&self, webhook: &Webhook, chain: &Chain) -> AttemptOutcome {
        let started = Instant::now();
        let mut request = self
            .client
            .post(&webhook.url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Gantry-Trigger", chain.trigger.as_str())
            .header("X-Gantry-Webhook", webhook.id.to_string())
            .header("X-Gantry-Delivery", chain.id.to_string())
            .body(chain.body.clone());
        if !webhook.secret.is_empty() {
            request = request.header(
                signature::HEADER,
                signature::sign(&webhook.secret, chain.body.as_bytes()),
            );
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                AttemptOutcome {
                    result: classify(status),
                    status: Some(status),
                    body: Some(truncate(body, self.config.max_response_body)),
                    error: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => AttemptOutcome {
                result: DeliveryResult::RetriableError,
                status: None,
                body: None,
                error: Some(if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                }),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    fn body(&self, envelope: &Envelope) -> Result<String> {
        let body = json!({
            "trigger": envelope.trigger,
            "payload": envelope.payload,
            "timestamp": self.clock.now(),
        });
        Ok(serde_json::to_string(&body)?)
    }
}

#[async_trait]
impl EventHandler for WebhookDispatcher {
    fn group(&self) -> &'static str {
        "webhooks"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        self.dispatch(event).await?;
        Ok(())
    }
}

/// 2xx succeeds; 429 and 5xx are worth retrying; anything else is final
pub fn classify(status: u16) -> DeliveryResult {
    match status {
        200..=299 => DeliveryResult::Success,
        429 | 500..=599 => DeliveryResult::RetriableError,
        _ => DeliveryResult::FatalError,
    }
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(204), DeliveryResult::Success);
        assert_eq!(classify(429), DeliveryResult::RetriableError);
        assert_eq!(classify(503), DeliveryResult::RetriableError);
        assert_eq!(classify(404), DeliveryResult::FatalError);
        assert_eq!(classify(301), DeliveryResult::FatalError);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo".to_string(), 2), "h");
        assert_eq!(truncate("short".to_string(), 1024), "short");
    }
}
