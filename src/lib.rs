pub mod capture;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod sim;

use serde::{Deserialize, Serialize};

pub use capture::{Camera, CameraMetadata, Frame};
pub use driver::{CameraDriver, FrameCallback, MulticastMode, StaticParams};
pub use error::{ConnectError, DriverError, PollError};
pub use pipeline::{FrameQueue, QueueStats};

/// Connection settings for a single camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// IP address of the camera to connect to.
    pub address: String,
    /// IP address of the local interface used for the connection.
    pub local_address: String,
    /// Number of internal buffers for the streaming channel.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
    /// MTU packet size.
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,
    /// Maximum number of frames queued for `poll()`. Once the limit is
    /// reached the oldest queued frame is dropped. Zero queues without
    /// limit.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_buffer_count() -> u32 {
    10
}

fn default_packet_size() -> u32 {
    9000
}

fn default_queue_capacity() -> usize {
    50
}

impl CameraConfig {
    pub fn new(address: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            local_address: local_address.into(),
            buffer_count: default_buffer_count(),
            packet_size: default_packet_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}
