//! Content folder parsing
//!
//! A content folder holds numbered slide images and exactly one caption file:
//!
//! ```text
//! 2024-06-01-launch/
//!   slide-1.jpg
//!   slide-2.png
//!   caption.txt
//! ```
//!
//! Carousel slides are named `slide-N`, `slide_N`, `slideN` or just `N`.
//! Stories use `story-N` (same separators) and win over slide naming when both
//! are present. Only `jpg`, `jpeg` and `png` files count; names are matched
//! case-insensitively. Files that match neither convention are ignored.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::ContentError;
use crate::types::{PostContent, PostType};

pub const MAX_SLIDES: usize = 10;
pub const MAX_CAPTION_LENGTH: usize = 2200;
pub const MAX_HASHTAGS: usize = 30;

const CAPTION_NAMES: [&str; 2] = ["caption.txt", "legenda.txt"];

static STORY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^story[-_]?(\d+)\.(jpg|jpeg|png)$").expect("story pattern should compile")
});

static SLIDE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:slide[-_]?)?(\d+)\.(jpg|jpeg|png)$").expect("slide pattern should compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slide {
    key: u32,
    name: String,
    path: PathBuf,
}

/// What a folder listing contains, before any validation
#[derive(Debug, Default)]
struct Listing {
    stories: Vec<Slide>,
    slides: Vec<Slide>,
    captions: Vec<PathBuf>,
}

impl Listing {
    fn read(folder: &Path) -> Result<Self, ContentError> {
        if !folder.is_dir() {
            return Err(ContentError::NotADirectory(folder.to_path_buf()));
        }

        let entries = std::fs::read_dir(folder).map_err(|e| ContentError::Io(e.to_string()))?;
        let mut listing = Listing::default();

        for entry in entries {
            let entry = entry.map_err(|e| ContentError::Io(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            if CAPTION_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
                listing.captions.push(path);
            } else if let Some(key) = order_key(&STORY_PATTERN, &name) {
                listing.stories.push(Slide { key, name, path });
            } else if let Some(key) = order_key(&SLIDE_PATTERN, &name) {
                listing.slides.push(Slide { key, name, path });
            } else {
                tracing::trace!(file = %name, "Ignoring file outside the naming convention");
            }
        }

        Ok(listing)
    }

    fn post_type(&self) -> Option<PostType> {
        if !self.stories.is_empty() {
            Some(PostType::Story)
        } else {
            match self.slides.len() {
                0 => None,
                1 => Some(PostType::Single),
                _ => Some(PostType::Carousel),
            }
        }
    }
}

fn order_key(pattern: &Regex, name: &str) -> Option<u32> {
    let captures = pattern.captures(name)?;
    match captures[1].parse::<u32>() {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(file = %name, "Slide number out of range, ignoring file");
            None
        }
    }
}

/// Parse a folder into validated post content
pub fn parse(folder: &Path) -> Result<PostContent, ContentError> {
    let listing = Listing::read(folder)?;
    let post_type = listing
        .post_type()
        .ok_or_else(|| ContentError::NoSlides(folder.to_path_buf()))?;

    let mut slides = if post_type == PostType::Story {
        if !listing.slides.is_empty() {
            tracing::debug!(
                folder = %folder.display(),
                ignored = listing.slides.len(),
                "Story folder also contains slide images, using story images only"
            );
        }
        listing.stories
    } else {
        listing.slides
    };

    if slides.len() > MAX_SLIDES {
        return Err(ContentError::TooManySlides {
            found: slides.len(),
            max: MAX_SLIDES,
        });
    }

    slides.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.name.cmp(&b.name)));
    for pair in slides.windows(2) {
        if pair[0].key == pair[1].key {
            return Err(ContentError::DuplicateOrderKey {
                key: pair[0].key,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }

    let caption = read_caption(folder, &listing.captions)?;

    Ok(PostContent {
        folder: folder.to_path_buf(),
        post_type,
        slides: slides.into_iter().map(|s| s.path).collect(),
        caption,
    })
}

/// Classify a folder from its file names alone
pub fn detect_type(folder: &Path) -> Result<PostType, ContentError> {
    Listing::read(folder)?
        .post_type()
        .ok_or_else(|| ContentError::NoSlides(folder.to_path_buf()))
}

/// Quick check for listings: `(true, "ok")` or `(false, reason)`
pub fn is_valid_folder(folder: &Path) -> (bool, String) {
    match parse(folder) {
        Ok(_) => (true, "ok".to_string()),
        Err(e) => (false, e.to_string()),
    }
}

fn read_caption(folder: &Path, captions: &[PathBuf]) -> Result<String, ContentError> {
    let path = match captions {
        [] => return Err(ContentError::MissingCaption(folder.to_path_buf())),
        [one] => one,
        many => {
            let mut names: Vec<String> = many
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            names.sort();
            return Err(ContentError::MultipleCaptions(names));
        }
    };

    let bytes = std::fs::read(path).map_err(|e| ContentError::Io(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| ContentError::CaptionEncoding(path.clone()))?;
    let caption = text.trim_start_matches('\u{feff}').trim().to_string();

    let length = caption.chars().count();
    if length > MAX_CAPTION_LENGTH {
        return Err(ContentError::CaptionTooLong {
            length,
            max: MAX_CAPTION_LENGTH,
        });
    }

    let hashtags = count_hashtags(&caption);
    if hashtags > MAX_HASHTAGS {
        return Err(ContentError::TooManyHashtags {
            count: hashtags,
            max: MAX_HASHTAGS,
        });
    }

    Ok(caption)
}

fn count_hashtags(caption: &str) -> usize {
    caption
        .split_whitespace()
        .filter(|word| word.starts_with('#') && word.len() > 1)
        .count()
}
