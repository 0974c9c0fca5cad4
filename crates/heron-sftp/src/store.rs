//! Configuration store
//!
//! NIST 800-53: CM-6 (Configuration Settings)
//! Implementation: Holds the current desired-state snapshot behind a watch
//! channel. Readers clone an `Arc` and never block; each publish replaces the
//! whole snapshot and queues the new generation for application.

use chrono::{DateTime, Utc};
use heron_core::{DesiredState, SftpDocument};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::apply::{ApplyQueue, ApplyRequest};

#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub state: Arc<DesiredState>,
    pub published_at: DateTime<Utc>,
}

pub struct ConfigurationStore {
    current: watch::Sender<Arc<Snapshot>>,
    queue: ApplyQueue,
}

impl ConfigurationStore {
    /// Start at generation 1 with `initial`. The initial state is applied by
    /// the startup sequence, so nothing is queued here.
    pub fn new(initial: DesiredState, queue: ApplyQueue) -> Self {
        let snapshot = Arc::new(Snapshot {
            generation: 1,
            state: Arc::new(initial),
            published_at: Utc::now(),
        });
        let (current, _) = watch::channel(snapshot);
        Self { current, queue }
    }

    pub fn get(&self) -> Arc<DesiredState> {
        self.current.borrow().state.clone()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.borrow().generation
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.current.subscribe()
    }

    /// Validate `document` and make it current. Returns the generation in
    /// effect afterwards; a document that validates to the current state is
    /// not republished.
    pub fn publish(&self, document: SftpDocument) -> u64 {
        let state = document.validate();
        let mut published = None;

        self.current.send_if_modified(|current| {
            if *current.state == state {
                return false;
            }
            let generation = current.generation + 1;
            *current = Arc::new(Snapshot {
                generation,
                state: Arc::new(state),
                published_at: Utc::now(),
            });
            published = Some(generation);
            true
        });

        match published {
            Some(generation) => {
                info!(generation, "SFTP configuration was changed");
                self.queue.submit(ApplyRequest::Configuration { generation });
                generation
            }
            None => {
                info!("SFTP configuration reloaded without changes");
                self.generation()
            }
        }
    }
}
