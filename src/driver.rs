//! Black-box contract with the device driver layer
//!
//! The lifecycle controller treats the camera SDK as an opaque capability
//! provider. Everything protocol-specific (packet reassembly, resend
//! bookkeeping, transport) lives behind this trait.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::DriverError;

/// Multicast behavior requested when opening a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticastMode {
    /// Exclusive unicast connection.
    #[default]
    None,
    /// Listen to a stream controlled by another host.
    Listener,
    /// Control the camera while streaming to a multicast group.
    Controller,
}

/// Fixed per-device parameters captured once after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticParams {
    /// Frequency of the hardware timestamp counter, in ticks per second.
    pub tick_frequency: u64,
    /// Imager width in pixels.
    pub width: u32,
    /// Imager height in pixels.
    pub height: u32,
    /// Size of one delivered frame buffer in bytes.
    pub buffer_size: u32,
}

/// Frame-delivery callback. Invoked by the driver's own thread of control
/// once per completed frame, with the owned pixel data and the hardware
/// tick count at acquisition.
pub type FrameCallback = Arc<dyn Fn(Bytes, u64) + Send + Sync>;

/// Capability contract implemented by a device driver.
///
/// Handles are opaque: the controller only ever hands them back to the
/// driver that produced them. `close_connection` and `close_stream` take
/// their handle by value; a released handle cannot be used again.
pub trait CameraDriver: Send + 'static {
    type DeviceHandle: Send;
    type StreamHandle: Send;

    /// Open a connection to the camera at `remote` through the local
    /// interface `local`. The device considers itself lost if no heartbeat
    /// arrives within `heartbeat_timeout`.
    fn open_connection(
        &self,
        remote: IpAddr,
        local: IpAddr,
        heartbeat_timeout: Duration,
        mode: MulticastMode,
    ) -> Result<Self::DeviceHandle, DriverError>;

    /// Release a device connection. Best-effort; never fails.
    fn close_connection(&self, device: Self::DeviceHandle);

    /// Read the manufacturer and model strings.
    fn query_identity(&self, device: &Self::DeviceHandle)
        -> Result<(String, String), DriverError>;

    /// Read the fixed device parameters.
    fn query_static_params(&self, device: &Self::DeviceHandle)
        -> Result<StaticParams, DriverError>;

    /// Fix the pixel depth, in bits per pixel.
    fn set_pixel_depth(&self, device: &Self::DeviceHandle, bits: u8) -> Result<(), DriverError>;

    /// Configure the acquisition frame rate in frames per second.
    fn set_frame_rate(&self, device: &Self::DeviceHandle, fps: f64) -> Result<(), DriverError>;

    /// Configure the exposure time in milliseconds.
    fn set_exposure(&self, device: &Self::DeviceHandle, ms: f64) -> Result<(), DriverError>;

    /// Open a streaming channel bound to `device`. `on_frame` is invoked by
    /// the driver for every completed frame until the stream is closed.
    /// Packet bookkeeping and resend begin after `resend_timeout`.
    fn open_stream(
        &self,
        device: &Self::DeviceHandle,
        buffer_count: u32,
        packet_size: u32,
        resend_timeout: Duration,
        on_frame: FrameCallback,
    ) -> Result<Self::StreamHandle, DriverError>;

    /// Start or pause frame delivery on an open stream.
    fn enable_stream(&self, stream: &Self::StreamHandle, enabled: bool)
        -> Result<(), DriverError>;

    /// Release a streaming channel. Best-effort; never fails. No frame
    /// callback is invoked after this returns.
    fn close_stream(&self, stream: Self::StreamHandle);
}
