//! Engine liveness: shared self-metrics plus the periodic heartbeat task.
//!
//! The heartbeat runs independently of the tick loop, so a wedged or
//! erroring tick still reports. Presence of the TTL'd broker key is the
//! aliveness signal; absence means the engine is down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::warn;

use crate::broker::channels::{CHANNEL_HEARTBEAT, KEY_HEARTBEAT};
use crate::broker::{Broker, MessageType};

const HEARTBEAT_TTL: Duration = Duration::from_secs(30);
const DURATION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Initializing,
    Running,
    Stopped,
    Error,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Initializing => "initializing",
            EngineStatus::Running => "running",
            EngineStatus::Stopped => "stopped",
            EngineStatus::Error => "error",
        }
    }
}

/// Self-metrics shared between the tick loop and the heartbeat task.
pub struct EngineShared {
    status: RwLock<EngineStatus>,
    pub current_tick: AtomicI64,
    pub market_open: AtomicBool,
    pub ticks_processed: AtomicU64,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    tick_durations_ms: RwLock<VecDeque<f64>>,
    started_at: Instant,
}

impl EngineShared {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(EngineStatus::Initializing),
            current_tick: AtomicI64::new(0),
            market_open: AtomicBool::new(true),
            ticks_processed: AtomicU64::new(0),
            last_tick_at: RwLock::new(None),
            tick_durations_ms: RwLock::new(VecDeque::with_capacity(DURATION_WINDOW)),
            started_at: Instant::now(),
        }
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: EngineStatus) {
        *self.status.write() = status;
    }

    /// Record one completed tick's wall-clock duration.
    pub fn record_tick(&self, tick: i64, market_open: bool, duration_ms: f64) {
        self.current_tick.store(tick, Ordering::Relaxed);
        self.market_open.store(market_open, Ordering::Relaxed);
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        *self.last_tick_at.write() = Some(Utc::now());

        let mut durations = self.tick_durations_ms.write();
        if durations.len() >= DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    pub fn avg_tick_duration_ms(&self) -> f64 {
        let durations = self.tick_durations_ms.read();
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<f64>() / durations.len() as f64
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_at.read()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl Default for EngineShared {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub tick: i64,
    pub status: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub market_open: bool,
    pub last_tick_at: Option<String>,
    pub avg_tick_duration_ms: f64,
    pub ticks_processed: u64,
    pub uptime_ms: u64,
}

impl HeartbeatPayload {
    pub fn capture(shared: &EngineShared) -> Self {
        Self {
            tick: shared.current_tick.load(Ordering::Relaxed),
            status: shared.status().as_str().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            market_open: shared.market_open.load(Ordering::Relaxed),
            last_tick_at: shared.last_tick_at().map(|t| t.to_rfc3339()),
            avg_tick_duration_ms: shared.avg_tick_duration_ms(),
            ticks_processed: shared.ticks_processed.load(Ordering::Relaxed),
            uptime_ms: shared.uptime_ms(),
        }
    }
}

/// Publish one heartbeat: the TTL'd key slot plus the raw channel.
/// Failures are logged, never fatal.
pub fn publish_heartbeat(broker: &Broker, shared: &EngineShared) {
    let payload = HeartbeatPayload::capture(shared);
    match serde_json::to_string(&payload) {
        Ok(json) => broker.set_key(KEY_HEARTBEAT, json, Some(HEARTBEAT_TTL)),
        Err(e) => warn!(error = %e, "failed to serialize heartbeat"),
    }
    if let Err(e) = broker.publish_raw(CHANNEL_HEARTBEAT, MessageType::Heartbeat, &payload) {
        warn!(error = %e, "heartbeat publish failed");
    }
}

/// Spawn the periodic heartbeat task.
pub fn spawn_heartbeat(
    broker: Arc<Broker>,
    shared: Arc<EngineShared>,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(interval_ms.max(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shared.status() == EngineStatus::Stopped {
                break;
            }
            publish_heartbeat(&broker, &shared);
        }
    })
}
