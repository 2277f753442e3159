//! Error types surfaced by the camera lifecycle and the frame queue

use thiserror::Error;

/// Error reported by the underlying device driver, carrying the SDK's
/// numeric error code and message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure modes of `Camera::connect`.
///
/// Every stage failure carries the underlying driver error. Whatever was
/// acquired before the failing stage has already been released when the
/// error is returned; the caller never needs to tear anything down.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Malformed input, rejected before any resource acquisition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Opening the device connection failed.
    #[error("device unreachable: {0}")]
    DeviceUnreachable(#[source] DriverError),
    /// The device answered but its identity could not be read.
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(#[source] DriverError),
    /// Querying static parameters or fixing the pixel depth failed.
    #[error("configuration failed: {0}")]
    ConfigurationFailed(#[source] DriverError),
    /// Opening or enabling the streaming channel failed.
    #[error("stream setup failed: {0}")]
    StreamSetupFailed(#[source] DriverError),
}

/// Failure modes of `Camera::poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// No frame arrived within the requested timeout.
    #[error("timed out waiting for a frame")]
    TimedOut,
    /// The device was torn down while waiting.
    #[error("stream closed")]
    StreamClosed,
}
