//! Central error handling for the trace3d sync core.
//!
//! Provides a unified RenderError enum with consistent categorization
//! across the memory pool, sync engine, and statistics pipeline.

/// Centralized error type for all sync-core operations
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// Device allocation failed. Fatal to the affected entity's sync; the
    /// entity keeps its last-good synced state. Never retried internally.
    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    /// Operation issued outside its legal state-machine transition.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Use of a released memory or acceleration-structure handle.
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    /// Backend failure that is none of the above.
    #[error("Device error: {0}")]
    Device(String),
}

impl RenderError {
    /// Convenience constructors for common error types
    pub fn out_of_memory<T: ToString>(msg: T) -> Self {
        RenderError::OutOfMemory(msg.to_string())
    }

    pub fn invalid_state<T: ToString>(msg: T) -> Self {
        RenderError::InvalidState(msg.to_string())
    }

    pub fn stale_handle<T: ToString>(msg: T) -> Self {
        RenderError::StaleHandle(msg.to_string())
    }

    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }
}

/// Result type alias for sync-core operations
pub type RenderResult<T> = Result<T, RenderError>;
