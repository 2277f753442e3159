//! Simulated camera driver
//!
//! Stands in for the real device SDK when no hardware is on the network:
//! the demo binary streams gradient frames from it, and the tests use its
//! scripted stage failures, recorded call log, and manual delivery hook to
//! act as the delivery context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::driver::{CameraDriver, FrameCallback, MulticastMode, StaticParams};
use crate::error::DriverError;

/// Behavior of a [`SimulatedCamera`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub manufacturer: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub tick_frequency: u64,
    /// When set, an internal thread delivers gradient frames at this
    /// interval while the stream is enabled.
    pub frame_interval: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            manufacturer: "SimVision".into(),
            model: "SV-1200".into(),
            width: 1296,
            height: 966,
            tick_frequency: 1_000_000_000,
            frame_interval: None,
        }
    }
}

/// Opaque device handle handed out by the simulator.
pub struct SimDeviceHandle(());

/// Opaque stream handle handed out by the simulator.
pub struct SimStreamHandle(());

/// In-process [`CameraDriver`] implementation.
///
/// Cheap to clone; all clones share one simulated device, so a test can
/// keep a clone as a control handle after the camera has taken ownership
/// of the driver.
#[derive(Clone)]
pub struct SimulatedCamera {
    inner: Arc<SimInner>,
}

struct SimInner {
    config: SimConfig,
    fail_open_connection: AtomicBool,
    fail_query_identity: AtomicBool,
    fail_query_params: AtomicBool,
    fail_open_stream: AtomicBool,
    fail_enable_stream: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
    sink: Mutex<Option<FrameCallback>>,
    streaming: AtomicBool,
    frame_rate: Mutex<Option<f64>>,
    exposure_ms: Mutex<Option<f64>>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedCamera {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(SimInner {
                config,
                fail_open_connection: AtomicBool::new(false),
                fail_query_identity: AtomicBool::new(false),
                fail_query_params: AtomicBool::new(false),
                fail_open_stream: AtomicBool::new(false),
                fail_enable_stream: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
                streaming: AtomicBool::new(false),
                frame_rate: Mutex::new(None),
                exposure_ms: Mutex::new(None),
                generator: Mutex::new(None),
            }),
        }
    }

    fn record(&self, call: &'static str) {
        lock(&self.inner.calls).push(call);
    }

    /// Every driver entry point invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.inner.calls).clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| **call == name)
            .count()
    }

    pub fn fail_open_connection(&self, fail: bool) {
        self.inner.fail_open_connection.store(fail, Ordering::SeqCst);
    }

    pub fn fail_query_identity(&self, fail: bool) {
        self.inner.fail_query_identity.store(fail, Ordering::SeqCst);
    }

    pub fn fail_query_params(&self, fail: bool) {
        self.inner.fail_query_params.store(fail, Ordering::SeqCst);
    }

    pub fn fail_open_stream(&self, fail: bool) {
        self.inner.fail_open_stream.store(fail, Ordering::SeqCst);
    }

    pub fn fail_enable_stream(&self, fail: bool) {
        self.inner.fail_enable_stream.store(fail, Ordering::SeqCst);
    }

    pub fn frame_rate(&self) -> Option<f64> {
        *lock(&self.inner.frame_rate)
    }

    pub fn exposure_ms(&self) -> Option<f64> {
        *lock(&self.inner.exposure_ms)
    }

    /// Act as the delivery context: feed one frame through the registered
    /// callback. Returns false once the stream is disabled or closed,
    /// mirroring a driver that stops invoking the callback at that point.
    pub fn deliver(&self, data: Bytes, timestamp: u64) -> bool {
        if !self.inner.streaming.load(Ordering::SeqCst) {
            return false;
        }
        let sink = lock(&self.inner.sink).clone();
        match sink {
            Some(sink) => {
                sink(data, timestamp);
                true
            }
            None => false,
        }
    }

    fn stop_generator(&self) {
        self.inner.streaming.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.generator).take() {
            let _ = handle.join();
        }
    }
}

impl CameraDriver for SimulatedCamera {
    type DeviceHandle = SimDeviceHandle;
    type StreamHandle = SimStreamHandle;

    fn open_connection(
        &self,
        _remote: std::net::IpAddr,
        _local: std::net::IpAddr,
        _heartbeat_timeout: Duration,
        _mode: MulticastMode,
    ) -> Result<SimDeviceHandle, DriverError> {
        self.record("open_connection");
        if self.inner.fail_open_connection.load(Ordering::SeqCst) {
            return Err(DriverError::new(57, "no camera detected at address"));
        }
        Ok(SimDeviceHandle(()))
    }

    fn close_connection(&self, _device: SimDeviceHandle) {
        self.record("close_connection");
    }

    fn query_identity(
        &self,
        _device: &SimDeviceHandle,
    ) -> Result<(String, String), DriverError> {
        self.record("query_identity");
        if self.inner.fail_query_identity.load(Ordering::SeqCst) {
            return Err(DriverError::new(13, "identity register read failed"));
        }
        Ok((
            self.inner.config.manufacturer.clone(),
            self.inner.config.model.clone(),
        ))
    }

    fn query_static_params(
        &self,
        _device: &SimDeviceHandle,
    ) -> Result<StaticParams, DriverError> {
        self.record("query_static_params");
        if self.inner.fail_query_params.load(Ordering::SeqCst) {
            return Err(DriverError::new(13, "parameter register read failed"));
        }
        let config = &self.inner.config;
        Ok(StaticParams {
            tick_frequency: config.tick_frequency,
            width: config.width,
            height: config.height,
            // 12-bit pixels are delivered in two bytes each.
            buffer_size: config.width * config.height * 2,
        })
    }

    fn set_pixel_depth(&self, _device: &SimDeviceHandle, _bits: u8) -> Result<(), DriverError> {
        self.record("set_pixel_depth");
        Ok(())
    }

    fn set_frame_rate(&self, _device: &SimDeviceHandle, fps: f64) -> Result<(), DriverError> {
        self.record("set_frame_rate");
        *lock(&self.inner.frame_rate) = Some(fps);
        Ok(())
    }

    fn set_exposure(&self, _device: &SimDeviceHandle, ms: f64) -> Result<(), DriverError> {
        self.record("set_exposure");
        *lock(&self.inner.exposure_ms) = Some(ms);
        Ok(())
    }

    fn open_stream(
        &self,
        _device: &SimDeviceHandle,
        _buffer_count: u32,
        _packet_size: u32,
        _resend_timeout: Duration,
        on_frame: FrameCallback,
    ) -> Result<SimStreamHandle, DriverError> {
        self.record("open_stream");
        if self.inner.fail_open_stream.load(Ordering::SeqCst) {
            return Err(DriverError::new(21, "streaming channel setup failed"));
        }
        *lock(&self.inner.sink) = Some(on_frame);
        Ok(SimStreamHandle(()))
    }

    fn enable_stream(
        &self,
        _stream: &SimStreamHandle,
        enabled: bool,
    ) -> Result<(), DriverError> {
        self.record("enable_stream");
        if self.inner.fail_enable_stream.load(Ordering::SeqCst) {
            return Err(DriverError::new(22, "streaming channel enable failed"));
        }
        if !enabled {
            self.stop_generator();
            return Ok(());
        }
        self.inner.streaming.store(true, Ordering::SeqCst);
        if let Some(interval) = self.inner.config.frame_interval {
            let inner = Arc::clone(&self.inner);
            let handle = thread::spawn(move || {
                debug!("frame generator started");
                let mut seq: u64 = 0;
                while inner.streaming.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    let Some(sink) = lock(&inner.sink).clone() else {
                        break;
                    };
                    let frame = gradient_frame(inner.config.width, inner.config.height, seq);
                    sink(frame, seq * interval.as_nanos() as u64);
                    seq += 1;
                }
                debug!(frames = seq, "frame generator stopped");
            });
            *lock(&self.inner.generator) = Some(handle);
        }
        Ok(())
    }

    fn close_stream(&self, _stream: SimStreamHandle) {
        self.record("close_stream");
        self.stop_generator();
        *lock(&self.inner.sink) = None;
    }
}

/// 12-bit gradient test pattern, two bytes per pixel, little endian.
fn gradient_frame(width: u32, height: u32, seq: u64) -> Bytes {
    let mut data = Vec::with_capacity((width * height * 2) as usize);
    for y in 0..height {
        for x in 0..width {
            let value = ((x + y + seq as u32) % 4096) as u16;
            data.extend_from_slice(&value.to_le_bytes());
        }
    }
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Camera;
    use crate::CameraConfig;

    #[test]
    fn gradient_pattern_has_two_bytes_per_pixel() {
        let frame = gradient_frame(8, 4, 0);
        assert_eq!(frame.len(), 8 * 4 * 2);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), 0);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 1);
    }

    #[test]
    fn generator_streams_frames_end_to_end() {
        let sim = SimulatedCamera::new(SimConfig {
            width: 32,
            height: 8,
            frame_interval: Some(Duration::from_millis(5)),
            ..SimConfig::default()
        });
        let config = CameraConfig::new("192.168.100.2", "192.168.100.1");
        let camera = Camera::connect(sim.clone(), &config).unwrap();

        let frame = camera.poll(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 8);
        assert_eq!(frame.data.len(), 32 * 8 * 2);

        camera.disconnect();
        assert_eq!(sim.call_count("close_stream"), 1);
    }
}
