//! Deployment lifecycle events.
//!
//! The notifier is strictly fire-and-forget: a sink that is down or slow
//! must never change the outcome of a deployment run, so publish failures
//! are logged and swallowed.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

/// What happened to a deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    Started,
    Finished,
    Failed { message: String },
}

/// One lifecycle event for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentEvent {
    pub deployment: String,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Boundary to whatever carries events out of the director.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DeploymentEvent) -> anyhow::Result<()>;
}

/// Publishes lifecycle events, absorbing sink failures.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn deployment_started(&self, deployment: &str) {
        self.send(deployment, EventKind::Started).await;
    }

    pub async fn deployment_finished(&self, deployment: &str) {
        self.send(deployment, EventKind::Finished).await;
    }

    pub async fn deployment_failed(&self, deployment: &str, message: &str) {
        self.send(
            deployment,
            EventKind::Failed {
                message: message.to_string(),
            },
        )
        .await;
    }

    async fn send(&self, deployment: &str, kind: EventKind) {
        let event = DeploymentEvent {
            deployment: deployment.to_string(),
            kind,
            timestamp: unix_now(),
        };
        if let Err(e) = self.sink.publish(event).await {
            warn!(deployment, error = %e, "event publish failed, continuing");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<DeploymentEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: DeploymentEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event);
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_carry_deployment_and_kind() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(vec![]),
            fail: false,
        });
        let notifier = Notifier::new(sink.clone());

        notifier.deployment_started("prod").await;
        notifier.deployment_failed("prod", "boom").await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].deployment, "prod");
        assert_eq!(events[0].kind, EventKind::Started);
        assert_eq!(
            events[1].kind,
            EventKind::Failed {
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(vec![]),
            fail: true,
        });
        let notifier = Notifier::new(sink);

        // Must not panic or propagate.
        notifier.deployment_finished("prod").await;
    }
}
