//! Submission error types.

use thiserror::Error;

/// Errors that can occur on the submission path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// A host-side (CPU) allocation failed.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// A GPU buffer allocation failed. Recoverable: pool state is left
    /// untouched and the caller may retry after freeing memory elsewhere.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The kernel rejected or faulted a submission.
    #[error("submission failed: {0}")]
    SubmitFailed(String),
    /// The device was lost. Terminal: no further submissions on this
    /// device are attempted.
    #[error("device lost")]
    DeviceLost,
}

pub type SubmitResult<T> = Result<T, SubmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SubmitError::OutOfDeviceMemory.to_string(),
            "out of device memory"
        );
        assert_eq!(
            SubmitError::SubmitFailed("ioctl EINVAL".into()).to_string(),
            "submission failed: ioctl EINVAL"
        );
        assert_eq!(SubmitError::DeviceLost.to_string(), "device lost");
    }
}
