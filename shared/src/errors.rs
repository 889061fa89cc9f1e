use thiserror::Error;

/// Failures while creating, attaching, or validating the shared segment.
///
/// Everything here is fatal for the session that hit it; the hot paths on
/// both sides never construct errors (ring pressure surfaces as a dropped
/// counter instead).
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("file mapping `{name}` could not be created: {source}")]
    Create {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file mapping `{name}` was not found")]
    NotFound { name: String },

    #[error("mapping a view of `{name}` failed: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment magic 0x{found:08X} is not the expected 0x{expected:08X}")]
    MagicMismatch { expected: u32, found: u32 },

    #[error("segment channel {found} does not match expected channel {expected}")]
    ChannelMismatch { expected: u32, found: u32 },
}
