//! Normalizing slide images into what the platform accepts
//!
//! Every slide becomes an RGB JPEG that fits within the size limit of its post
//! type. One bad slide fails the whole folder: a partial carousel is never
//! published.

pub mod codec;

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use codec::{ColorMode, Dimensions, Encoded, ImageCodec, ImageCrateCodec, ImageInfo};

use crate::error::ImageError;
use crate::types::{PostContent, PostType};

pub const CAROUSEL_MAX: Dimensions = Dimensions::new(1080, 1350);
pub const STORY_MAX: Dimensions = Dimensions::new(1080, 1920);
pub const SINGLE_MAX: Dimensions = Dimensions::new(1080, 1080);

pub const MIN_DIMENSION: u32 = 320;
pub const MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;
pub const JPEG_QUALITY: u8 = 95;
const QUALITY_STEP: u8 = 10;
const MIN_QUALITY: u8 = 35;

/// JPEG qualities tried in order until the output fits [`MAX_FILE_SIZE`]
pub fn quality_ladder() -> Vec<u8> {
    (MIN_QUALITY..=JPEG_QUALITY)
        .rev()
        .step_by(usize::from(QUALITY_STEP))
        .collect()
}

pub fn max_dimensions(post_type: PostType) -> Dimensions {
    match post_type {
        PostType::Carousel => CAROUSEL_MAX,
        PostType::Story => STORY_MAX,
        PostType::Single => SINGLE_MAX,
    }
}

/// Result of checking a source image against platform rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageVerdict {
    Accepted,
    Rejected(String),
}

impl ImageVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ImageVerdict::Accepted)
    }
}

#[derive(Clone)]
pub struct ImageProcessor {
    codec: Arc<dyn ImageCodec>,
    output_root: PathBuf,
}

impl ImageProcessor {
    /// Processed images are written under `output_root/<folder id>/`
    pub fn new(codec: Arc<dyn ImageCodec>, output_root: PathBuf) -> Self {
        Self { codec, output_root }
    }

    pub fn with_default_codec(output_root: PathBuf) -> Self {
        Self::new(Arc::new(ImageCrateCodec::new()), output_root)
    }

    pub fn output_dir(&self, folder_id: &str) -> PathBuf {
        self.output_root.join(folder_id)
    }

    pub fn validate_for_instagram(&self, path: &Path) -> ImageVerdict {
        let info = match self.codec.inspect(path) {
            Ok(info) => info,
            Err(e) => return ImageVerdict::Rejected(e.to_string()),
        };

        let Dimensions { width, height } = info.dimensions;
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            return ImageVerdict::Rejected(format!(
                "{} is {}x{}, minimum is {}px per side",
                path.display(),
                width,
                height,
                MIN_DIMENSION
            ));
        }
        if let ColorMode::Unsupported(mode) = &info.color {
            return ImageVerdict::Rejected(format!(
                "{} uses unsupported color mode {}",
                path.display(),
                mode
            ));
        }
        ImageVerdict::Accepted
    }

    /// Normalize every slide, in order. Blocking; run it off the async runtime.
    pub fn process_folder(
        &self,
        folder_id: &str,
        content: &PostContent,
    ) -> Result<Vec<PathBuf>, ImageError> {
        let out_dir = self.output_dir(folder_id);
        self.clear(folder_id);
        std::fs::create_dir_all(&out_dir).map_err(|e| ImageError::Encode {
            path: out_dir.clone(),
            reason: e.to_string(),
        })?;

        let max = max_dimensions(content.post_type);
        let result: Result<Vec<PathBuf>, ImageError> = content
            .slides
            .par_iter()
            .enumerate()
            .map(|(index, src)| {
                let dest = out_dir.join(format!("{:02}.jpg", index + 1));
                self.process_slide(src, &dest, max)?;
                Ok(dest)
            })
            .collect();

        if result.is_err() {
            self.clear(folder_id);
        }
        result
    }

    /// [`process_folder`](Self::process_folder) on the blocking thread pool
    pub async fn process_folder_async(
        &self,
        folder_id: &str,
        content: &PostContent,
    ) -> Result<Vec<PathBuf>, ImageError> {
        let processor = self.clone();
        let folder_id = folder_id.to_string();
        let content = content.clone();
        tokio::task::spawn_blocking(move || processor.process_folder(&folder_id, &content))
            .await
            .map_err(|e| ImageError::Task(e.to_string()))?
    }

    fn process_slide(&self, src: &Path, dest: &Path, max: Dimensions) -> Result<(), ImageError> {
        if let ImageVerdict::Rejected(reason) = self.validate_for_instagram(src) {
            return Err(ImageError::Rejected(reason));
        }

        let encoded = self
            .codec
            .normalize(src, dest, max, &quality_ladder(), MAX_FILE_SIZE)?;
        if encoded.size > MAX_FILE_SIZE {
            return Err(ImageError::Rejected(format!(
                "{} is still {} bytes at quality {}",
                src.display(),
                encoded.size,
                encoded.quality
            )));
        }
        tracing::debug!(
            src = %src.display(),
            width = encoded.dimensions.width,
            height = encoded.dimensions.height,
            quality = encoded.quality,
            "Normalized slide"
        );
        Ok(())
    }

    /// Delete processed output for a folder
    pub fn clear(&self, folder_id: &str) {
        let dir = self.output_dir(folder_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove processed images");
            }
        }
    }
}
