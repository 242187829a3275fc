//! Content folders: parsing, lifecycle on disk and posting order

pub mod parser;
pub mod queue;
pub mod source;

pub use parser::{detect_type, is_valid_folder, parse};
pub use queue::PostQueue;
pub use source::{ContentSource, Location};
