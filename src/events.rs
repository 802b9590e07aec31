//! Domain event recorder.
//!
//! Bounded buffer of events keyed by machine metadata, served through the
//! Machine Runtime events surface. A background task evicts expired events;
//! the per-machine cap bounds memory regardless of TTL.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::machine::Metadata;

pub const REASON_PULLED_IMAGE: &str = "PulledImage";
pub const REASON_VOLUME_ATTACHED: &str = "VolumeAttached";
pub const REASON_VOLUME_DETACHED: &str = "VolumeDetached";
pub const REASON_NIC_ATTACHED: &str = "NetworkInterfaceAttached";
pub const REASON_NIC_DETACHED: &str = "NetworkInterfaceDetached";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub machine_id: String,
    pub machine_labels: BTreeMap<String, String>,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventRecorder {
    inner: Arc<Inner>,
}

struct Inner {
    events: Mutex<VecDeque<Event>>,
    ttl: chrono::Duration,
    max_per_machine: usize,
}

impl EventRecorder {
    pub fn new(ttl: Duration, max_per_machine: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(5)),
                max_per_machine,
            }),
        }
    }

    pub fn record(
        &self,
        metadata: &Metadata,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let event = Event {
            machine_id: metadata.id.clone(),
            machine_labels: metadata.labels.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        debug!(
            machine_id = %event.machine_id,
            reason = %event.reason,
            "recording {} event: {}",
            event.event_type.as_str(),
            event.message
        );

        let mut events = self.inner.events.lock().expect("event lock");
        let for_machine =
            events.iter().filter(|e| e.machine_id == event.machine_id).count();
        if for_machine >= self.inner.max_per_machine {
            if let Some(oldest) = events
                .iter()
                .position(|e| e.machine_id == event.machine_id)
            {
                events.remove(oldest);
            }
        }
        events.push_back(event);
    }

    /// All non-expired events, oldest first.
    pub fn list(&self) -> Vec<Event> {
        let horizon = Utc::now() - self.inner.ttl;
        self.inner
            .events
            .lock()
            .expect("event lock")
            .iter()
            .filter(|e| e.timestamp >= horizon)
            .cloned()
            .collect()
    }

    fn gc(&self) {
        let horizon = Utc::now() - self.inner.ttl;
        let mut events = self.inner.events.lock().expect("event lock");
        while matches!(events.front(), Some(e) if e.timestamp < horizon) {
            events.pop_front();
        }
    }

    /// Periodic eviction of expired events until cancellation.
    pub async fn run_gc(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => self.gc(),
            }
        }
    }
}
