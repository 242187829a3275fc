//! AutoPost - scheduled posting of content folders
//!
//! This library turns a directory of prepared folders (slides plus a caption)
//! into posts published at fixed times of day, with retry, history and
//! archiving on disk.

pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod imaging;
pub mod logging;
pub mod orchestrator;
pub mod publisher;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{AutopostError, Result};
pub use orchestrator::{CycleOutcome, ReconcileReport};
pub use service::{AutopostService, ServiceStatus};
pub use types::{ContentFolder, FolderState, PostRecord, PostType};
