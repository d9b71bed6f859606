//! pixcache
//!
//! Size-bounded in-memory cache for decoded raster images, fed by a single
//! background worker that decodes sources on demand and evicts
//! least-recently-used entries once the byte budget is exceeded.
//!
//! Features:
//! - Cost-aware LRU cache keyed by (source path, scale constraint)
//! - Power-of-two downsampling decode for PNG, JPEG, GIF, WebP
//! - One decode worker at a time; it drains the queue and exits
//! - Display targets silently drop decodes they no longer want

pub mod cache;
pub mod decoder;
pub mod loader;
pub mod registry;
pub mod targets;

pub use cache::{CacheStats, ImageCache, ImageKey};
pub use decoder::{DecodedImage, ImageFormat, decode_scaled, probe_dimensions, sample_factor};
pub use loader::{ImageLoader, LoadListener, RenderTarget, target_id};
pub use registry::{LoaderRegistry, MAX_MEMORY_FACTOR, MIN_MEMORY_FACTOR};
pub use targets::{TargetId, TargetRegistry};

/// Load error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source locator does not name an existing file
    #[error("Source not found: {0}")]
    SourceNotFound(std::path::PathBuf),

    /// The encoded bytes are not in a format this crate decodes
    #[error("Unsupported image format")]
    UnsupportedFormat,

    /// The source could not be decoded
    #[error("Decode failed: {0}")]
    Decode(#[from] image::ImageError),

    /// The source could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
