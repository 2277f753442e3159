use bytes::Bytes;

/// A single delivered image.
///
/// A frame owns its pixel data outright: ownership moves from the delivery
/// context into the queue at push time and from the queue to the consumer
/// at pop time. Deliberately not `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    /// Raw pixel data as delivered by the streaming channel.
    pub data: Bytes,

    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Bits per pixel.
    pub depth: u8,

    /// Hardware tick count at acquisition.
    pub timestamp: u64,
}

impl Frame {
    /// Acquisition time in seconds, given the camera's timestamp tick
    /// frequency.
    pub fn timestamp_secs(&self, tick_frequency: u64) -> f64 {
        if tick_frequency == 0 {
            return 0.0;
        }
        self.timestamp as f64 / tick_frequency as f64
    }
}
