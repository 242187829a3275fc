//! In-memory posting order over PENDING folders

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{ContentFolder, FolderState};

/// FIFO of pending folders, oldest discovery first
///
/// Every operation takes the internal lock once, so a dequeue hands a folder
/// to exactly one caller. An empty queue returns `None` immediately.
#[derive(Default)]
pub struct PostQueue {
    entries: Mutex<VecDeque<ContentFolder>>,
}

impl PostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ContentFolder>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the queue contents with the given pending folders
    pub fn refresh(&self, pending: Vec<ContentFolder>) {
        let mut sorted: Vec<ContentFolder> = pending
            .into_iter()
            .filter(|f| f.state == FolderState::Pending)
            .collect();
        sorted.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        *self.lock() = sorted.into();
    }

    /// Insert in discovery order; a folder already queued is left alone.
    /// Returns false for duplicates and non-pending folders.
    pub fn enqueue(&self, folder: ContentFolder) -> bool {
        if folder.state != FolderState::Pending {
            return false;
        }
        let mut entries = self.lock();
        if entries.iter().any(|f| f.id == folder.id) {
            return false;
        }
        let position = entries
            .iter()
            .position(|f| {
                (f.discovered_at, f.name.as_str()) > (folder.discovered_at, folder.name.as_str())
            })
            .unwrap_or(entries.len());
        entries.insert(position, folder);
        true
    }

    pub fn dequeue_next(&self) -> Option<ContentFolder> {
        self.lock().pop_front()
    }

    pub fn peek(&self) -> Option<ContentFolder> {
        self.lock().front().cloned()
    }

    pub fn remove(&self, folder_id: &str) -> Option<ContentFolder> {
        let mut entries = self.lock();
        let index = entries.iter().position(|f| f.id == folder_id)?;
        entries.remove(index)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn list(&self) -> Vec<ContentFolder> {
        self.lock().iter().cloned().collect()
    }
}
