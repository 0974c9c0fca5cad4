//! Shared model for heron: the validated desired state and its error type.

pub mod document;
pub mod error;
pub mod types;

pub use document::SftpDocument;
pub use error::{HeronError, Result};
pub use types::{
    ChrootPolicy, CryptoOverrides, DesiredState, GlobalPolicy, GroupAccount, HookLists,
    HostKeyMaterial, LoggingFilters, UserAccount,
};
