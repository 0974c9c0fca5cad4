//! Serialized application of desired state
//!
//! Configuration changes and daemon exits both funnel through one queue and
//! are handled by a single worker, so reconciliation and daemon restarts never
//! interleave and converge in arrival order.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};
use crate::store::ConfigurationStore;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRequest {
    /// Desired state generation `generation` was published.
    Configuration { generation: u64 },
    /// The daemon spawned under `epoch` exited.
    DaemonExited { epoch: u64 },
}

/// The most recent configuration generation that was fully applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub generation: u64,
    pub at: DateTime<Utc>,
}

impl Applied {
    pub fn now(generation: u64) -> Self {
        Self {
            generation,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyQueue {
    tx: mpsc::UnboundedSender<ApplyRequest>,
}

impl ApplyQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApplyRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, request: ApplyRequest) {
        if self.tx.send(request).is_err() {
            warn!(?request, "Apply queue is closed; request dropped");
        }
    }
}

pub struct ApplyWorker {
    rx: mpsc::UnboundedReceiver<ApplyRequest>,
    store: Arc<ConfigurationStore>,
    bus: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
    applied: Arc<watch::Sender<Option<Applied>>>,
}

impl ApplyWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ApplyRequest>,
        store: Arc<ConfigurationStore>,
        bus: Arc<EventBus>,
        supervisor: Arc<Supervisor>,
        applied: Arc<watch::Sender<Option<Applied>>>,
    ) -> Self {
        Self {
            rx,
            store,
            bus,
            supervisor,
            applied,
        }
    }

    /// Process requests until `shutdown` fires or every sender is gone. A
    /// request already in progress always runs to completion.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Apply worker started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => self.process(request).await,
                    None => break,
                },
            }
        }
        info!("Apply worker stopped");
    }

    pub async fn process(&self, request: ApplyRequest) {
        match request {
            ApplyRequest::Configuration { generation } => {
                let latest = self.store.generation();
                if generation < latest {
                    debug!(generation, latest, "Skipping superseded configuration");
                    return;
                }
                info!(generation, "Applying configuration");
                match self
                    .bus
                    .publish(&Event::ConfigurationChanged { generation })
                    .await
                {
                    Ok(()) => {
                        self.applied.send_replace(Some(Applied::now(generation)));
                        info!(generation, event = "configuration_applied", "Configuration applied");
                    }
                    Err(e) => error!(generation, error = %e, "Failed to apply configuration"),
                }
            }
            ApplyRequest::DaemonExited { epoch } => {
                if let Err(e) = self.supervisor.on_daemon_exited(epoch).await {
                    error!(epoch, error = %e, "Failed to recover daemon");
                }
            }
        }
    }
}
