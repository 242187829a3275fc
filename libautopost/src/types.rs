//! Core types for AutoPost

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::scheduler::slots::TimeSlot;

/// Current layout of the persisted scheduler payload
pub const SCHEDULER_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Carousel,
    Story,
    Single,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Carousel => "carousel",
            PostType::Story => "story",
            PostType::Single => "single",
        }
    }
}

impl FromStr for PostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "carousel" => Ok(PostType::Carousel),
            "story" => Ok(PostType::Story),
            "single" => Ok(PostType::Single),
            other => Err(format!("unknown post type '{}'", other)),
        }
    }
}

impl std::fmt::Display for PostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a content folder
///
/// `Pending -> Processing -> Posted | Failed`. Terminal states never revert on
/// their own; only an explicit folder reset moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FolderState {
    Pending,
    Processing,
    Posted,
    Failed,
}

impl FolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderState::Pending => "pending",
            FolderState::Processing => "processing",
            FolderState::Posted => "posted",
            FolderState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FolderState::Posted | FolderState::Failed)
    }
}

impl FromStr for FolderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FolderState::Pending),
            "processing" => Ok(FolderState::Processing),
            "posted" => Ok(FolderState::Posted),
            "failed" => Ok(FolderState::Failed),
            other => Err(format!("unknown folder state '{}'", other)),
        }
    }
}

impl std::fmt::Display for FolderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentFolder {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub remote_id: Option<String>,
    pub post_type: Option<PostType>,
    pub state: FolderState,
    pub discovered_at: i64,
    pub completed_at: Option<i64>,
}

impl ContentFolder {
    /// A freshly discovered folder, named after the last path component
    pub fn discovered(path: PathBuf, remote_id: Option<String>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            path,
            remote_id,
            post_type: None,
            state: FolderState::Pending,
            discovered_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }
}

/// Parsed, validated content of a folder
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PostContent {
    pub folder: PathBuf,
    pub post_type: PostType,
    /// Slide images in ascending order key
    pub slides: Vec<PathBuf>,
    pub caption: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// Why a posting cycle failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Folder structure or caption problem
    Content,
    /// Unreadable or unacceptable image
    Image,
    /// Retries exhausted on network, rate-limit or timeout failures
    Transient,
    /// Publisher rejected the post
    Permanent,
    /// Publisher session rejected
    Auth,
    /// Process stopped while the folder was being published
    Interrupted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Content => "content",
            ErrorClass::Image => "image",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Auth => "auth",
            ErrorClass::Interrupted => "interrupted",
        }
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(ErrorClass::Content),
            "image" => Ok(ErrorClass::Image),
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            "auth" => Ok(ErrorClass::Auth),
            "interrupted" => Ok(ErrorClass::Interrupted),
            other => Err(format!("unknown error class '{}'", other)),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one posting cycle for one folder
///
/// `id` and `attempt` are assigned by the store when the record is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostRecord {
    pub id: Option<i64>,
    pub folder_id: String,
    pub attempt: i64,
    pub recorded_at: i64,
    pub outcome: Outcome,
    pub platform_post_id: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub publish_calls: u32,
}

impl PostRecord {
    pub fn success(folder_id: &str, platform_post_id: Option<String>, publish_calls: u32) -> Self {
        Self {
            id: None,
            folder_id: folder_id.to_string(),
            attempt: 0,
            recorded_at: chrono::Utc::now().timestamp(),
            outcome: Outcome::Success,
            platform_post_id,
            error_class: None,
            error_message: None,
            publish_calls,
        }
    }

    pub fn failure(
        folder_id: &str,
        class: ErrorClass,
        message: impl Into<String>,
        publish_calls: u32,
    ) -> Self {
        Self {
            id: None,
            folder_id: folder_id.to_string(),
            attempt: 0,
            recorded_at: chrono::Utc::now().timestamp(),
            outcome: Outcome::Failure,
            platform_post_id: None,
            error_class: Some(class),
            error_message: Some(message.into()),
            publish_calls,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// A history row joined with the folder it belongs to
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub folder_name: String,
    pub post_type: Option<PostType>,
    #[serde(flatten)]
    pub record: PostRecord,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_success: i64,
    pub total_failure: i64,
    pub posted_today: i64,
    pub posted_last_7_days: i64,
}

/// Persisted scheduler payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerState {
    pub version: u32,
    pub enabled: bool,
    pub slots: Vec<TimeSlot>,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    /// Set when automatic posting stopped on its own
    pub suspended_reason: Option<String>,
}

impl SchedulerState {
    pub fn new(slots: Vec<TimeSlot>) -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            enabled: true,
            slots,
            last_run: None,
            next_run: None,
            suspended_reason: None,
        }
    }
}
