//! In-process event bus
//!
//! Subscribers are kept per event kind in registration order. `publish`
//! awaits each handler before moving to the next and before returning, so a
//! publisher observes the complete effect of its event.

use async_trait::async_trait;
use heron_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new desired-state generation was validated and published.
    ConfigurationChanged { generation: u64 },
    /// The daemon process was (re)spawned.
    ServerStartup,
    /// A session event arrived for a user (`open_session`, `close_session`, ...).
    SessionChanged { username: String, state: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConfigurationChanged,
    ServerStartup,
    SessionChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConfigurationChanged { .. } => EventKind::ConfigurationChanged,
            Event::ServerStartup => EventKind::ServerStartup,
            Event::SessionChanged { .. } => EventKind::SessionChanged,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!(?kind, handler = handler.name(), "Subscribing handler");
        self.subscribers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Deliver `event` to every subscriber in order. The first handler error
    /// stops delivery and is returned.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        // The lock is released before handlers run; they may publish too.
        let handlers = self
            .subscribers
            .read()
            .await
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            debug!(?event, handler = handler.name(), "Dispatching event");
            if let Err(e) = handler.handle(event).await {
                error!(?event, handler = handler.name(), error = %e, "Event handler failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
