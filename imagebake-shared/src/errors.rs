//! Error types for the image baking workflow.

use thiserror::Error;

/// Result alias used across imagebake crates.
pub type BakeResult<T> = Result<T, BakeError>;

/// Every failure a bake run can surface.
///
/// All variants are fatal to the run. Cleanup failures are logged by the
/// workflow and never converted into one of these.
#[derive(Debug, Error)]
pub enum BakeError {
    /// Malformed request or settings, detected before any resource exists.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The target artifact already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No source image matched the family selector.
    #[error("not found: {0}")]
    NotFound(String),

    /// Instance or disk creation/deletion failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Completion sentinel never observed, or polling failed for good.
    #[error("completion watch failed: {0}")]
    WatchFailed(String),

    /// Image or tarball creation failed.
    #[error("artifact extraction failed: {0}")]
    Extraction(String),

    /// Local filesystem errors (payload staging, settings files).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BakeError {
    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BakeError::Validation(_) => "validation",
            BakeError::Conflict(_) => "conflict",
            BakeError::NotFound(_) => "not_found",
            BakeError::Provisioning(_) => "provisioning",
            BakeError::WatchFailed(_) => "watch_failed",
            BakeError::Extraction(_) => "extraction",
            BakeError::Storage(_) => "storage",
            BakeError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for BakeError {
    fn from(err: std::io::Error) -> Self {
        BakeError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_message() {
        let err = BakeError::Conflict("image \"base\" already exists".into());
        assert_eq!(err.to_string(), "conflict: image \"base\" already exists");
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BakeError = io.into();
        assert!(matches!(err, BakeError::Storage(_)));
    }
}
