// =============================================================================
// Notification Sinks — lifecycle events out of the engine
// =============================================================================
//
// Every Opened / Closed transition produces exactly one `LifecycleEvent`
// which is handed to the configured sink. Delivery is best effort: a failed
// delivery is logged and never feeds back into signal state.
//
// Sinks:
//   - LogSink        structured `tracing` line per event
//   - BroadcastSink  tokio broadcast channel feeding WebSocket subscribers
//   - WebhookSink    JSON POST to a configured URL
//   - FanoutSink     delivers to several sinks independently
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::LifecycleEvent;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Deliver `event` and swallow any failure after logging it.
pub async fn notify(sink: &dyn NotificationSink, event: &LifecycleEvent) {
    if let Err(e) = sink.deliver(event).await {
        warn!(
            sink = sink.name(),
            kind = %event.kind,
            signal_id = %event.signal.id,
            error = %e,
            "notification delivery failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        info!(
            kind = %event.kind,
            owner = %event.owner_key,
            instrument = %event.instrument_key,
            signal_id = %event.signal.id,
            direction = %event.signal.direction,
            price = ?event.price,
            "SIGNAL {}",
            event.kind
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Publishes events on a broadcast channel. Having no subscribers is not an
/// error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        match self.tx.send(event.clone()) {
            Ok(n) => debug!(subscribers = n, kind = %event.kind, "event broadcast"),
            Err(_) => debug!(kind = %event.kind, "no event subscribers"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl std::fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSink").field("url", &self.url).finish()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("webhook POST to {} failed", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned HTTP {}: {}", status, body);
        }
        debug!(url = %self.url, kind = %event.kind, "webhook delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Delivers to every inner sink; one failing sink does not stop the others.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        for sink in &self.sinks {
            notify(sink.as_ref(), event).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod recording {
    use super::*;
    use crate::types::EventKind;
    use parking_lot::Mutex;

    /// Keeps every delivered event; optionally fails every delivery after
    /// recording it, or stalls `Opened` deliveries before recording them.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<LifecycleEvent>>,
        fail: bool,
        opened_delay: Option<Duration>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn slow_opened(delay: Duration) -> Self {
            Self {
                opened_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn events(&self) -> Vec<LifecycleEvent> {
            self.events.lock().clone()
        }

        pub fn count(&self) -> usize {
            self.events.lock().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
            if let (Some(delay), EventKind::Opened) = (self.opened_delay, event.kind) {
                tokio::time::sleep(delay).await;
            }
            self.events.lock().push(event.clone());
            if self.fail {
                anyhow::bail!("sink offline");
            }
            Ok(())
        }
    }
}
