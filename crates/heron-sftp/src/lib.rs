//! # Heron SFTP
//!
//! Runs an OpenSSH `sshd` as a managed SFTP-only service driven by a
//! declarative desired state.
//!
//! ## Features
//!
//! - OS account and group reconciliation against the desired state
//! - `sshd_config` rendering with per-user chroot `Match` blocks
//! - Host key import and generation
//! - Daemon supervision with crash recovery and restart on change
//! - On-demand chroot preparation from PAM session events
//! - Startup and session hook scripts
//!
//! Configuration changes and daemon exits are applied strictly one at a time
//! through the [`apply`] queue.

pub mod accounts;
pub mod apply;
pub mod authorized_keys;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod host_keys;
pub mod ledger;
pub mod pam;
pub mod permissions;
pub mod reconciler;
pub mod session;
pub mod sshd_config;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use daemon::{DaemonLauncher, DaemonProcess, LaunchSpec, OutputFilter, SshdLauncher};
pub use engine::{Engine, EngineStatus};
pub use events::{Event, EventBus, EventHandler, EventKind};
pub use executor::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use heron_core::{HeronError, Result};
pub use session::{PamEvent, SessionService};
pub use store::ConfigurationStore;
pub use supervisor::{DaemonState, Supervisor};
