use crate::background::BackgroundSelection;
use crate::metrics::MetricsSnapshot;
use crate::overlay::OverlayMetadata;
use crate::render::BackendKind;
use tokio::sync::broadcast;

const CAPACITY: usize = 64;

/// One variant per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    BackgroundSelected(BackgroundSelection),
    /// 0-100
    OpacityChanged(f32),
    /// Output pixels, 0-15
    FeatherChanged(f32),
    OverlayUpdated(Option<OverlayMetadata>),
    MetricsSnapshot(MetricsSnapshot),
    SessionStarted { backend: BackendKind },
    SessionStopped,
}

impl BusEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::BackgroundSelected(_) => "bg-selected",
            BusEvent::OpacityChanged(_) => "opacity-changed",
            BusEvent::FeatherChanged(_) => "feather-changed",
            BusEvent::OverlayUpdated(_) => "overlay-updated",
            BusEvent::MetricsSnapshot(_) => "metrics-snapshot",
            BusEvent::SessionStarted { .. } => "session-started",
            BusEvent::SessionStopped => "session-stopped",
        }
    }
}

/// Typed publish/subscribe channel handed to the components that use it.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Deliver to every current subscriber. Having none is fine.
    pub fn publish(&self, event: BusEvent) {
        tracing::trace!(topic = event.topic(), "bus publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
