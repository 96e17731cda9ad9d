//! Outbound webhook delivery: one signed POST per active agent per tick,
//! bounded parallel fan-out, failure counting with pause-until-reconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::broker::channels::{CallbackConfirmedPayload, PriceUpdate};
use crate::broker::Envelope;
use crate::models::{ActionResult, Agent, Holding, InvestigationAlert, Order, Trade};
use crate::store::EngineStore;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-WSS-Signature";

/// HMAC-SHA256 of the exact request body, hex-encoded.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Per-agent tick payload POSTed to the callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTickPayload {
    pub tick: i64,
    pub timestamp: String,
    pub market_open: bool,
    pub regime: String,
    pub price_updates: Vec<PriceUpdate>,
    /// This agent's fills from the tick.
    pub fills: Vec<Trade>,
    /// This agent's open orders after settlement.
    pub orders: Vec<Order>,
    pub holdings: Vec<Holding>,
    pub cash: f64,
    pub investigation_alerts: Vec<InvestigationAlert>,
    /// Outcomes of the actions the agent returned last tick.
    pub action_results: Vec<ActionResult>,
}

/// Raw response from one delivery attempt.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: f64,
}

/// Transport seam: HTTP in production, an in-memory responder in tests.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, url: &str, body: &str, signature: &str) -> Result<WebhookResponse>;
}

/// reqwest-backed transport. Hard per-request timeout, no redirects.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(Policy::none())
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(&self, url: &str, body: &str, signature: &str) -> Result<WebhookResponse> {
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("webhook POST to {url} failed"))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(WebhookResponse {
            status,
            body,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

/// Result of one tick's fan-out: raw action values per responding agent.
/// Values stay untyped here so the action processor can report per-action
/// parse failures back to the agent.
pub type DispatchOutcome = Vec<(String, Vec<serde_json::Value>)>;

pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    timeout_ms: u64,
    failure_threshold: i64,
    concurrency: usize,
    /// Reconnect signals from the gateway.
    resume_rx: broadcast::Receiver<Envelope>,
}

impl WebhookDispatcher {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        timeout_ms: u64,
        failure_threshold: i64,
        concurrency: usize,
        resume_rx: broadcast::Receiver<Envelope>,
    ) -> Self {
        Self {
            transport,
            timeout_ms,
            failure_threshold,
            concurrency: concurrency.max(1),
            resume_rx,
        }
    }

    /// Drain pending reconnect confirmations and unpause those agents.
    fn apply_reconnects(&mut self, store: &EngineStore) {
        loop {
            match self.resume_rx.try_recv() {
                Ok(envelope) => {
                    let Ok(payload) =
                        serde_json::from_value::<CallbackConfirmedPayload>(envelope.payload)
                    else {
                        continue;
                    };
                    debug!(agent_id = %payload.agent_id, "callback reconnect confirmed, resuming webhooks");
                    if let Err(e) = store.resume_webhooks(&payload.agent_id) {
                        warn!(agent_id = %payload.agent_id, error = %e, "failed to resume webhooks");
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "reconnect channel lagged; confirmations dropped");
                }
                Err(_) => break,
            }
        }
    }

    /// Fan out this tick's payloads. At most one attempt per agent; the
    /// call returns once every response has arrived or timed out.
    pub async fn dispatch(
        &mut self,
        store: &Arc<EngineStore>,
        deliveries: Vec<(Agent, AgentTickPayload)>,
    ) -> DispatchOutcome {
        self.apply_reconnects(store);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<Option<(String, Vec<serde_json::Value>)>> = JoinSet::new();

        for (agent, payload) in deliveries {
            let Some(url) = agent.callback_url.clone() else {
                continue;
            };
            // Pause after the failure threshold until the gateway confirms
            // a reconnect.
            if agent.webhook_paused || agent.webhook_failures >= self.failure_threshold {
                continue;
            }

            let transport = self.transport.clone();
            let store = store.clone();
            let semaphore = semaphore.clone();
            let timeout_ms = self.timeout_ms;
            let failure_threshold = self.failure_threshold;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;

                let body = match serde_json::to_string(&payload) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(agent_id = %agent.id, error = %e, "failed to serialize webhook payload");
                        return None;
                    }
                };
                let secret = agent.webhook_secret.clone().unwrap_or_default();
                let signature = sign_body(&secret, &body);

                let outcome = timeout(
                    Duration::from_millis(timeout_ms),
                    transport.deliver(&url, &body, &signature),
                )
                .await;

                match outcome {
                    Ok(Ok(response)) if (200..300).contains(&(response.status as u32)) => {
                        let new_count = agent.response_count + 1;
                        let new_avg = (agent.avg_response_time_ms * agent.response_count as f64
                            + response.elapsed_ms)
                            / new_count as f64;
                        if let Err(e) = store.record_webhook_success(&agent.id, new_avg, new_count)
                        {
                            warn!(agent_id = %agent.id, error = %e, "failed to record webhook success");
                        }

                        let actions = parse_actions(&response.body);
                        if actions.is_empty() {
                            None
                        } else {
                            Some((agent.id, actions))
                        }
                    }
                    Ok(Ok(response)) => {
                        record_failure(
                            &store,
                            &agent,
                            failure_threshold,
                            &format!("HTTP {}", response.status),
                        );
                        None
                    }
                    Ok(Err(e)) => {
                        record_failure(&store, &agent, failure_threshold, &e.to_string());
                        None
                    }
                    Err(_) => {
                        record_failure(
                            &store,
                            &agent,
                            failure_threshold,
                            &format!("timeout after {timeout_ms}ms"),
                        );
                        None
                    }
                }
            });
        }

        let mut outcome = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(entry)) => outcome.push(entry),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "webhook task panicked"),
            }
        }
        // Deterministic downstream processing order.
        outcome.sort_by(|a, b| a.0.cmp(&b.0));
        outcome
    }
}

fn record_failure(store: &EngineStore, agent: &Agent, threshold: i64, error: &str) {
    let failures = agent.webhook_failures + 1;
    let paused = failures >= threshold;
    if paused {
        warn!(agent_id = %agent.id, failures, error, "webhook delivery paused until reconnect");
    }
    if let Err(e) = store.record_webhook_failure(&agent.id, failures, error, paused) {
        warn!(agent_id = %agent.id, error = %e, "failed to record webhook failure");
    }
}

/// Pull the `actions` array out of a response body, leniently.
fn parse_actions(body: &str) -> Vec<serde_json::Value> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Vec::new();
    };
    match value.get("actions") {
        Some(serde_json::Value::Array(actions)) => actions.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::channels::CHANNEL_CALLBACK_CONFIRMED;
    use crate::broker::{Broker, MessageType};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted in-memory transport.
    struct MemoryTransport {
        responses: Mutex<HashMap<String, (u16, String, u64)>>,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl MemoryTransport {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, url: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .insert(url.to_string(), (status, body.to_string(), 0));
        }

        fn respond_slow(&self, url: &str, status: u16, body: &str, delay_ms: u64) {
            self.responses
                .lock()
                .insert(url.to_string(), (status, body.to_string(), delay_ms));
        }
    }

    #[async_trait]
    impl WebhookTransport for MemoryTransport {
        async fn deliver(&self, url: &str, body: &str, signature: &str) -> Result<WebhookResponse> {
            self.calls
                .lock()
                .push((url.to_string(), body.to_string(), signature.to_string()));
            let entry = self.responses.lock().get(url).cloned();
            match entry {
                Some((status, body, delay_ms)) => {
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    Ok(WebhookResponse {
                        status,
                        body,
                        elapsed_ms: delay_ms as f64,
                    })
                }
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn payload(tick: i64) -> AgentTickPayload {
        AgentTickPayload {
            tick,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            market_open: true,
            regime: "normal".to_string(),
            price_updates: Vec::new(),
            fills: Vec::new(),
            orders: Vec::new(),
            holdings: Vec::new(),
            cash: 1000.0,
            investigation_alerts: Vec::new(),
            action_results: Vec::new(),
        }
    }

    fn agent_with_callback(id: &str, url: &str, secret: &str) -> Agent {
        let mut agent = Agent::new(id, id, 1000.0);
        agent.callback_url = Some(url.to_string());
        agent.webhook_secret = Some(secret.to_string());
        agent
    }

    fn dispatcher(
        transport: Arc<dyn WebhookTransport>,
        broker: &Broker,
        timeout_ms: u64,
    ) -> WebhookDispatcher {
        WebhookDispatcher::new(
            transport,
            timeout_ms,
            3,
            8,
            broker.subscribe(CHANNEL_CALLBACK_CONFIRMED),
        )
    }

    #[test]
    fn signature_is_stable_hex_hmac() {
        let sig = sign_body("secret", r#"{"tick":1}"#);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Same inputs, same signature; different key, different signature.
        assert_eq!(sig, sign_body("secret", r#"{"tick":1}"#));
        assert_ne!(sig, sign_body("other", r#"{"tick":1}"#));
    }

    #[tokio::test]
    async fn success_resets_failures_and_updates_mean() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        let broker = Broker::new();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond("http://a1/hook", 200, r#"{"actions":[{"type":"FLEE"}]}"#);

        let mut agent = agent_with_callback("a1", "http://a1/hook", "s");
        agent.webhook_failures = 2;
        agent.avg_response_time_ms = 100.0;
        agent.response_count = 1;
        store.upsert_agent(&agent).unwrap();
        store
            .record_webhook_failure(&agent.id, 2, "old error", false)
            .unwrap();
        let agent = store.get_agent("a1").unwrap().unwrap();

        let mut dispatcher = dispatcher(transport.clone(), &broker, 1000);
        let outcome = dispatcher.dispatch(&store, vec![(agent, payload(1))]).await;

        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome[0].0, "a1");
        assert_eq!(outcome[0].1.len(), 1);

        let reloaded = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(reloaded.webhook_failures, 0);
        assert_eq!(reloaded.last_webhook_error, None);
        assert_eq!(reloaded.response_count, 2);
        // Cumulative mean of 100 and 0.
        assert!((reloaded.avg_response_time_ms - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failures_accumulate_and_pause_at_threshold() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        let broker = Broker::new();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond("http://a1/hook", 500, "oops");

        let agent = agent_with_callback("a1", "http://a1/hook", "s");
        store.upsert_agent(&agent).unwrap();

        let mut dispatcher = dispatcher(transport.clone(), &broker, 1000);
        for _ in 0..3 {
            let current = store.get_agent("a1").unwrap().unwrap();
            dispatcher.dispatch(&store, vec![(current, payload(1))]).await;
        }

        let reloaded = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(reloaded.webhook_failures, 3);
        assert!(reloaded.webhook_paused);
        assert!(reloaded.last_webhook_error.unwrap().contains("HTTP 500"));

        // Paused agents are skipped entirely.
        transport.calls.lock().clear();
        let current = store.get_agent("a1").unwrap().unwrap();
        dispatcher.dispatch(&store, vec![(current, payload(2))]).await;
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn reconnect_confirmation_resumes_delivery() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        let broker = Broker::new();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond("http://a1/hook", 200, "{}");

        let agent = agent_with_callback("a1", "http://a1/hook", "s");
        store.upsert_agent(&agent).unwrap();
        store
            .record_webhook_failure("a1", 3, "down", true)
            .unwrap();

        let mut dispatcher = dispatcher(transport.clone(), &broker, 1000);

        // Gateway publishes the reconnect confirmation.
        broker
            .publish(
                CHANNEL_CALLBACK_CONFIRMED,
                MessageType::CallbackConfirmed,
                &CallbackConfirmedPayload {
                    agent_id: "a1".to_string(),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                },
            )
            .unwrap();

        let current = store.get_agent("a1").unwrap().unwrap();
        assert!(current.webhook_paused);
        dispatcher.dispatch(&store, vec![(current, payload(3))]).await;

        // The reconnect was applied before skipping, but the stale Agent
        // snapshot still carried paused=true; next tick delivers.
        let refreshed = store.get_agent("a1").unwrap().unwrap();
        assert!(!refreshed.webhook_paused);
        dispatcher.dispatch(&store, vec![(refreshed, payload(4))]).await;
        assert!(!transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let store = Arc::new(EngineStore::open_in_memory().unwrap());
        let broker = Broker::new();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_slow("http://slow/hook", 200, "{}", 500);

        let agent = agent_with_callback("a1", "http://slow/hook", "s");
        store.upsert_agent(&agent).unwrap();

        let mut dispatcher = dispatcher(transport.clone(), &broker, 20);
        let outcome = dispatcher
            .dispatch(&store, vec![(agent, payload(1))])
            .await;
        assert!(outcome.is_empty());

        let reloaded = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(reloaded.webhook_failures, 1);
        assert!(reloaded.last_webhook_error.unwrap().contains("timeout"));
    }

    #[test]
    fn action_parsing_is_lenient() {
        assert!(parse_actions("").is_empty());
        assert!(parse_actions("not json").is_empty());
        assert!(parse_actions("{}").is_empty());
        assert!(parse_actions(r#"{"actions": "nope"}"#).is_empty());
        let actions = parse_actions(r#"{"actions":[{"type":"FLEE"},{"type":"???"}]}"#);
        // Both values come through raw; validation happens downstream.
        assert_eq!(actions.len(), 2);
    }
}
