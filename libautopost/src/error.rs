//! Error types for AutoPost

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutopostError>;

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Remote sync error: {0}")]
    RemoteSync(#[from] RemoteSyncError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("A posting cycle is already running")]
    Busy,

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Folder {0} is not pending and cannot be claimed")]
    NotClaimable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AutopostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutopostError::InvalidInput(_) | AutopostError::FolderNotFound(_) => 3,
            AutopostError::Scheduler(SchedulerError::InvalidTime(_)) => 3,
            AutopostError::Busy => 4,
            AutopostError::Config(_) => 2,
            AutopostError::Database(_) => 2,
            _ => 1,
        }
    }

    /// True when automatic posting should stop until an operator intervenes
    pub fn suspends_scheduler(&self) -> bool {
        matches!(
            self,
            AutopostError::Database(_) | AutopostError::Publish(PublishError::Authentication(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt stored value in {column}: {value}")]
    CorruptValue { column: &'static str, value: String },
}

/// Problems with the structure or caption of a content folder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("No slide images found in {0}")]
    NoSlides(PathBuf),

    #[error("Too many slides: {found} (maximum {max})")]
    TooManySlides { found: usize, max: usize },

    #[error("Slides {first} and {second} share order key {key}")]
    DuplicateOrderKey { key: u32, first: String, second: String },

    #[error("Caption file missing in {0}")]
    MissingCaption(PathBuf),

    #[error("More than one caption file: {0:?}")]
    MultipleCaptions(Vec<String>),

    #[error("Caption is not valid UTF-8: {0}")]
    CaptionEncoding(PathBuf),

    #[error("Caption too long: {length} characters (maximum {max})")]
    CaptionTooLong { length: usize, max: usize },

    #[error("Too many hashtags: {count} (maximum {max})")]
    TooManyHashtags { count: usize, max: usize },

    #[error("Failed to read folder: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Image not found: {0}")]
    NotFound(PathBuf),

    #[error("Cannot decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Cannot encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Image rejected: {0}")]
    Rejected(String),

    #[error("Image processing task failed: {0}")]
    Task(String),
}

/// Failures reported by the publishing client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Post rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Publisher did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

impl PublishError {
    /// Network trouble, throttling and timeouts are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PublishError::Network(_) | PublishError::RateLimit(_) | PublishError::Timeout(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum RemoteSyncError {
    #[error("Listing remote folders failed: {0}")]
    Listing(String),

    #[error("Downloading {id} failed: {reason}")]
    Download { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Invalid time '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
}
