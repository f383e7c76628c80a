//! # placy
//!
//! Stamps placeholder values into built artifacts: plain text, JVM class files and archives
//! of any nesting (ZIP/JAR, TAR, gzip, bzip2, xz), rewriting only what contains a placeholder.
//!
//! ## Architecture
//!
//! - **placeholder**: Ordered placeholder maps, longest key first
//! - **text**: Text substitution, sequential, chunk-parallel or streaming
//! - **classfile**: Constant pool parsing and UTF-8 constant rewriting
//! - **archive**: Container detection, codec framing and entry-by-entry repacking
//! - **classify**: Content classification by name hint and magic bytes
//! - **cache**: Bounded result caches keyed by content and map fingerprints
//! - **pool**: The shared worker pool with per-task timeouts and panic isolation
//! - **stamp**: The facade that routes payloads between the transformers
//! - **scan**: Input tree discovery and memory-mapped reads for the binary

pub mod archive;
pub mod cache;
pub mod charset;
pub mod classfile;
pub mod classify;
pub mod cli;
pub mod config;
pub mod error;
pub mod placeholder;
pub mod pool;
pub mod result;
pub mod scan;
pub mod search;
pub mod stamp;
pub mod text;

pub use error::{Error, Result};
pub use placeholder::PlaceholderMap;
pub use result::{ProcessingResult, Warning};
pub use stamp::{Collaborator, StampConfig, Stamper};
