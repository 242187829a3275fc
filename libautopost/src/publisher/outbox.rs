//! Publisher that hands posts to a local outbox directory
//!
//! Each accepted post becomes a directory holding the normalized images, the
//! caption and a `post.json` manifest. An uploader running next to the daemon
//! (or a person) can pick them up from there.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{PublishReceipt, PublishResult, Publisher};
use crate::error::PublishError;
use crate::types::PostType;

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    post_id: &'a str,
    post_type: PostType,
    created_at: i64,
    images: Vec<String>,
    caption: Option<&'a str>,
}

pub struct OutboxPublisher {
    dir: PathBuf,
    session: AtomicBool,
}

impl OutboxPublisher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            session: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn deliver(
        &self,
        post_type: PostType,
        images: &[PathBuf],
        caption: Option<&str>,
    ) -> PublishResult {
        if !self.session.load(Ordering::SeqCst) {
            return Err(PublishError::Authentication("outbox not opened".to_string()));
        }
        if images.is_empty() {
            return Err(PublishError::Validation("no images to publish".to_string()));
        }

        let post_id = Uuid::new_v4().simple().to_string();
        let created_at = chrono::Utc::now();
        let target = self
            .dir
            .join(format!("{}_{}", created_at.format("%Y%m%d_%H%M%S"), &post_id[..8]));
        tokio::fs::create_dir_all(&target).await.map_err(io_to_publish)?;

        let mut names = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let name = format!("{:02}.jpg", index + 1);
            tokio::fs::copy(image, target.join(&name))
                .await
                .map_err(|e| PublishError::Validation(format!("{}: {}", image.display(), e)))?;
            names.push(name);
        }

        if let Some(caption) = caption {
            tokio::fs::write(target.join("caption.txt"), caption)
                .await
                .map_err(io_to_publish)?;
        }

        let manifest = Manifest {
            post_id: &post_id,
            post_type,
            created_at: created_at.timestamp(),
            images: names,
            caption,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        tokio::fs::write(target.join("post.json"), json)
            .await
            .map_err(io_to_publish)?;

        tracing::info!(post_id = %post_id, dir = %target.display(), "Post written to outbox");
        Ok(PublishReceipt {
            code: Some(post_id[..8].to_string()),
            post_id,
        })
    }
}

/// Disk trouble in the outbox is treated like a flaky network
fn io_to_publish(e: std::io::Error) -> PublishError {
    PublishError::Network(e.to_string())
}

#[async_trait]
impl Publisher for OutboxPublisher {
    async fn login(&self) -> bool {
        match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => {
                self.session.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "Cannot open outbox");
                false
            }
        }
    }

    async fn is_logged_in(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    async fn post_carousel(&self, images: &[PathBuf], caption: &str) -> PublishResult {
        self.deliver(PostType::Carousel, images, Some(caption)).await
    }

    async fn post_story(&self, images: &[PathBuf]) -> PublishResult {
        self.deliver(PostType::Story, images, None).await
    }

    async fn post_single(&self, image: &Path, caption: &str) -> PublishResult {
        self.deliver(PostType::Single, &[image.to_path_buf()], Some(caption))
            .await
    }

    fn name(&self) -> &str {
        "outbox"
    }
}
