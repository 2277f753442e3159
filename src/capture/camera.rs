//! Staged camera connection lifecycle
//!
//! Resources are acquired in a fixed order (device connection, identity,
//! static parameters, streaming channel) and released in exactly the
//! reverse order, however far acquisition got. Teardown runs identically
//! whether triggered by an explicit `disconnect` or by dropping the camera.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::capture::Frame;
use crate::driver::{CameraDriver, FrameCallback, MulticastMode};
use crate::error::{ConnectError, DriverError, PollError};
use crate::pipeline::{FrameQueue, QueueStats};
use crate::CameraConfig;

/// Camera released when heartbeat missing this long.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Packet bookkeeping and resend begin after this timeout.
const PACKET_RESEND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pixel depth requested from every camera, in bits.
const PIXEL_DEPTH_BITS: u8 = 12;

/// How far acquisition has progressed. Teardown walks this backwards from
/// whatever stage was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    NotReady,
    Connected,
    IdentityCaptured,
    Ready,
}

/// Static facts about a connected camera, captured once during `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraMetadata {
    /// Combined manufacturer and model label.
    pub name: String,
    /// Imager width in pixels.
    pub width: u32,
    /// Imager height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub depth: u8,
    /// Hardware timestamp ticks per second.
    pub tick_frequency: u64,
    /// Bytes per delivered frame buffer.
    pub buffer_size: u32,
}

/// Everything the lifecycle controller owns, with the stage that tracks
/// which of it has actually been acquired.
struct Connection<D: CameraDriver> {
    driver: D,
    device: Option<D::DeviceHandle>,
    name: Option<String>,
    stream: Option<D::StreamHandle>,
    queue: Arc<FrameQueue>,
    stage: Stage,
}

impl<D: CameraDriver> Connection<D> {
    fn device(&self) -> Result<&D::DeviceHandle, DriverError> {
        self.device
            .as_ref()
            .ok_or_else(|| DriverError::new(0, "device connection released"))
    }

    /// Release acquired resources in reverse stage order. Idempotent:
    /// every handle is taken out of its slot exactly once.
    fn release(&mut self) {
        if self.stage == Stage::NotReady {
            return;
        }
        if self.stage >= Stage::Ready {
            // Reject further pushes before the stream handle goes away; a
            // late frame must never reach a closed stream's queue.
            self.queue.close();
            if let Some(stream) = self.stream.take() {
                self.driver.close_stream(stream);
                debug!("stream closed");
            }
        }
        if self.stage >= Stage::IdentityCaptured {
            self.name = None;
        }
        if let Some(device) = self.device.take() {
            self.driver.close_connection(device);
            debug!("device connection closed");
        }
        self.stage = Stage::NotReady;
    }
}

impl<D: CameraDriver> Drop for Connection<D> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A live connection to a streaming camera.
///
/// Created by [`Camera::connect`], which either returns a fully ready
/// camera or an error with everything already rolled back. Frames arrive
/// on the driver's delivery thread and are drained with [`Camera::poll`].
pub struct Camera<D: CameraDriver> {
    conn: Mutex<Connection<D>>,
    queue: Arc<FrameQueue>,
    metadata: CameraMetadata,
}

impl<D: CameraDriver> std::fmt::Debug for Camera<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl<D: CameraDriver> Camera<D> {
    /// Connect to the camera described by `config`.
    ///
    /// Acquisition is staged: device connection, identity capture, static
    /// parameter query, stream setup. A failure at any stage tears down
    /// everything acquired so far before the error is returned.
    #[instrument(skip_all, fields(address = %config.address))]
    pub fn connect(driver: D, config: &CameraConfig) -> Result<Self, ConnectError> {
        let remote = parse_host_addr("address", &config.address)?;
        let local = parse_host_addr("local_address", &config.local_address)?;
        if config.buffer_count == 0 {
            return Err(ConnectError::InvalidArgument(
                "buffer_count must be positive".into(),
            ));
        }
        if config.packet_size == 0 {
            return Err(ConnectError::InvalidArgument(
                "packet_size must be positive".into(),
            ));
        }

        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        // From here on `conn` owns whatever has been acquired; an early
        // return drops it and runs the staged teardown.
        let mut conn = Connection {
            driver,
            device: None,
            name: None,
            stream: None,
            queue: Arc::clone(&queue),
            stage: Stage::NotReady,
        };

        debug!("opening device connection");
        let device = conn
            .driver
            .open_connection(remote, local, HEARTBEAT_TIMEOUT, MulticastMode::None)
            .map_err(ConnectError::DeviceUnreachable)?;
        conn.device = Some(device);
        conn.stage = Stage::Connected;

        let (manufacturer, model) = conn
            .device()
            .and_then(|device| conn.driver.query_identity(device))
            .map_err(ConnectError::IdentityUnavailable)?;
        conn.name = Some(format!("{manufacturer} {model}"));
        conn.stage = Stage::IdentityCaptured;

        let params = conn
            .device()
            .and_then(|device| conn.driver.query_static_params(device))
            .map_err(ConnectError::ConfigurationFailed)?;
        conn.device()
            .and_then(|device| conn.driver.set_pixel_depth(device, PIXEL_DEPTH_BITS))
            .map_err(ConnectError::ConfigurationFailed)?;

        let on_frame: FrameCallback = {
            let queue = Arc::clone(&queue);
            let (width, height) = (params.width, params.height);
            Arc::new(move |data: Bytes, timestamp: u64| {
                queue.push(Frame {
                    data,
                    width,
                    height,
                    depth: PIXEL_DEPTH_BITS,
                    timestamp,
                });
            })
        };
        let stream = conn
            .device()
            .and_then(|device| {
                conn.driver.open_stream(
                    device,
                    config.buffer_count,
                    config.packet_size,
                    PACKET_RESEND_TIMEOUT,
                    on_frame,
                )
            })
            .map_err(ConnectError::StreamSetupFailed)?;
        if let Err(err) = conn.driver.enable_stream(&stream, true) {
            conn.driver.close_stream(stream);
            return Err(ConnectError::StreamSetupFailed(err));
        }
        conn.stream = Some(stream);
        conn.stage = Stage::Ready;

        let metadata = CameraMetadata {
            name: conn.name.clone().unwrap_or_default(),
            width: params.width,
            height: params.height,
            depth: PIXEL_DEPTH_BITS,
            tick_frequency: params.tick_frequency,
            buffer_size: params.buffer_size,
        };
        info!(
            camera = %metadata.name,
            width = metadata.width,
            height = metadata.height,
            "camera ready"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            queue,
            metadata,
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection<D>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Static metadata captured at connect time.
    pub fn metadata(&self) -> &CameraMetadata {
        &self.metadata
    }

    /// Remove and return the oldest queued frame, waiting up to `timeout`
    /// for one to be delivered (indefinitely when `None`).
    ///
    /// Returns [`PollError::TimedOut`] on expiry and
    /// [`PollError::StreamClosed`] if the camera is disconnected while
    /// waiting.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Frame, PollError> {
        self.queue.pop_blocking(timeout)
    }

    /// Non-blocking variant of [`Camera::poll`].
    pub fn try_poll(&self) -> Option<Frame> {
        self.queue.try_pop()
    }

    /// Number of frames currently queued.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Cumulative delivery counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Configure the acquisition frame rate in frames per second.
    pub fn set_frame_rate(&self, fps: f64) -> Result<(), DriverError> {
        let conn = self.lock_conn();
        conn.device()
            .and_then(|device| conn.driver.set_frame_rate(device, fps))
    }

    /// Configure the exposure time in milliseconds.
    pub fn set_exposure(&self, ms: f64) -> Result<(), DriverError> {
        let conn = self.lock_conn();
        conn.device()
            .and_then(|device| conn.driver.set_exposure(device, ms))
    }

    /// Tear the connection down: close the stream, release the identity,
    /// close the device connection. Idempotent and non-failing; waiting
    /// `poll` calls are woken with [`PollError::StreamClosed`]. Dropping
    /// the camera without calling this performs the same teardown.
    pub fn disconnect(&self) {
        info!(camera = %self.metadata.name, "disconnecting");
        self.lock_conn().release();
    }
}

fn parse_host_addr(field: &str, value: &str) -> Result<IpAddr, ConnectError> {
    value.parse().map_err(|_| {
        ConnectError::InvalidArgument(format!("{field} is not a valid host address: {value:?}"))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::sim::{SimConfig, SimulatedCamera};

    fn config() -> CameraConfig {
        CameraConfig::new("192.168.100.2", "192.168.100.1")
    }

    fn connect(sim: &SimulatedCamera, config: &CameraConfig) -> Camera<SimulatedCamera> {
        Camera::connect(sim.clone(), config).expect("connect failed")
    }

    #[test]
    fn malformed_address_rejected_before_acquisition() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let mut cfg = config();
        cfg.address = "not-a-host".into();

        let err = Camera::connect(sim.clone(), &cfg).unwrap_err();
        assert!(matches!(err, ConnectError::InvalidArgument(_)));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn zero_buffer_count_rejected() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let mut cfg = config();
        cfg.buffer_count = 0;

        let err = Camera::connect(sim.clone(), &cfg).unwrap_err();
        assert!(matches!(err, ConnectError::InvalidArgument(_)));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn connect_captures_metadata() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = connect(&sim, &config());

        let meta = camera.metadata();
        assert_eq!(meta.name, "SimVision SV-1200");
        assert_eq!(meta.width, 1296);
        assert_eq!(meta.height, 966);
        assert_eq!(meta.depth, 12);
        assert_eq!(meta.tick_frequency, 1_000_000_000);
        assert_eq!(meta.buffer_size, 1296 * 966 * 2);

        assert_eq!(
            sim.calls(),
            vec![
                "open_connection",
                "query_identity",
                "query_static_params",
                "set_pixel_depth",
                "open_stream",
                "enable_stream",
            ]
        );
    }

    #[test]
    fn unreachable_device_surfaces_driver_error() {
        let sim = SimulatedCamera::new(SimConfig::default());
        sim.fail_open_connection(true);

        let err = Camera::connect(sim.clone(), &config()).unwrap_err();
        assert!(matches!(err, ConnectError::DeviceUnreachable(_)));
        assert_eq!(sim.call_count("close_connection"), 0);
    }

    #[test]
    fn identity_failure_rolls_back_connection() {
        let sim = SimulatedCamera::new(SimConfig::default());
        sim.fail_query_identity(true);

        let err = Camera::connect(sim.clone(), &config()).unwrap_err();
        assert!(matches!(err, ConnectError::IdentityUnavailable(_)));
        assert_eq!(sim.call_count("close_connection"), 1);
        assert_eq!(sim.call_count("open_stream"), 0);

        // Nothing leaked: the same arguments connect fine once the fault
        // clears.
        sim.fail_query_identity(false);
        let camera = connect(&sim, &config());
        camera.disconnect();
    }

    #[test]
    fn params_failure_releases_earlier_stages_once() {
        let sim = SimulatedCamera::new(SimConfig::default());
        sim.fail_query_params(true);

        let err = Camera::connect(sim.clone(), &config()).unwrap_err();
        assert!(matches!(err, ConnectError::ConfigurationFailed(_)));
        assert_eq!(sim.call_count("close_connection"), 1);
        assert_eq!(sim.call_count("open_stream"), 0);
        assert_eq!(sim.call_count("close_stream"), 0);
    }

    #[test]
    fn stream_open_failure_rolls_back_earlier_stages() {
        let sim = SimulatedCamera::new(SimConfig::default());
        sim.fail_open_stream(true);

        let err = Camera::connect(sim.clone(), &config()).unwrap_err();
        assert!(matches!(err, ConnectError::StreamSetupFailed(_)));
        assert_eq!(sim.call_count("close_stream"), 0);
        assert_eq!(sim.call_count("close_connection"), 1);
    }

    #[test]
    fn stream_enable_failure_closes_opened_stream() {
        let sim = SimulatedCamera::new(SimConfig::default());
        sim.fail_enable_stream(true);

        let err = Camera::connect(sim.clone(), &config()).unwrap_err();
        assert!(matches!(err, ConnectError::StreamSetupFailed(_)));
        assert_eq!(sim.call_count("close_stream"), 1);
        assert_eq!(sim.call_count("close_connection"), 1);
    }

    #[test]
    fn disconnect_releases_in_reverse_order() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = connect(&sim, &config());

        camera.disconnect();
        assert!(sim
            .calls()
            .ends_with(&["close_stream", "close_connection"]));

        // A second disconnect releases nothing twice.
        camera.disconnect();
        assert_eq!(sim.call_count("close_stream"), 1);
        assert_eq!(sim.call_count("close_connection"), 1);
    }

    #[test]
    fn drop_releases_like_disconnect() {
        let sim = SimulatedCamera::new(SimConfig::default());
        {
            let _camera = connect(&sim, &config());
        }
        assert_eq!(sim.call_count("close_stream"), 1);
        assert_eq!(sim.call_count("close_connection"), 1);
    }

    #[test]
    fn bounded_queue_keeps_newest_frames() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let mut cfg = config();
        cfg.queue_capacity = 2;
        let camera = connect(&sim, &cfg);

        for timestamp in [1, 2, 3] {
            assert!(sim.deliver(Bytes::from(vec![timestamp as u8; 16]), timestamp));
        }

        assert_eq!(camera.poll(None).unwrap().timestamp, 2);
        assert_eq!(camera.poll(None).unwrap().timestamp, 3);
        assert_eq!(
            camera.poll(Some(Duration::ZERO)),
            Err(PollError::TimedOut)
        );
        assert_eq!(camera.queue_stats().dropped, 1);
    }

    #[test]
    fn delivered_frames_carry_camera_geometry() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = connect(&sim, &config());

        sim.deliver(Bytes::from(vec![0xAB; 32]), 500_000_000);
        let frame = camera.try_poll().unwrap();
        assert_eq!(frame.width, 1296);
        assert_eq!(frame.height, 966);
        assert_eq!(frame.depth, 12);
        assert_eq!(frame.data.len(), 32);
        assert_eq!(
            frame.timestamp_secs(camera.metadata().tick_frequency),
            0.5
        );
    }

    #[test]
    fn blocked_poll_woken_by_concurrent_disconnect() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = Arc::new(connect(&sim, &config()));

        let consumer = {
            let camera = Arc::clone(&camera);
            thread::spawn(move || camera.poll(None))
        };

        thread::sleep(Duration::from_millis(20));
        camera.disconnect();

        assert_eq!(consumer.join().unwrap(), Err(PollError::StreamClosed));
    }

    #[test]
    fn delivery_racing_disconnect_never_partially_queues() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let mut cfg = config();
        cfg.queue_capacity = 4;
        let camera = connect(&sim, &cfg);

        let producer = {
            let sim = sim.clone();
            thread::spawn(move || {
                for timestamp in 0..1000 {
                    if !sim.deliver(Bytes::from(vec![0u8; 8]), timestamp) {
                        return timestamp;
                    }
                }
                1000
            })
        };

        thread::sleep(Duration::from_millis(5));
        camera.disconnect();
        producer.join().unwrap();

        // Whatever made it in before teardown obeys the bound, and nothing
        // is accepted afterwards.
        assert!(camera.pending() <= 4);
        assert!(!sim.deliver(Bytes::from(vec![0u8; 8]), 9999));
    }

    #[test]
    fn attribute_ops_forward_to_driver() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = connect(&sim, &config());

        camera.set_frame_rate(5.0).unwrap();
        camera.set_exposure(40.0).unwrap();
        assert_eq!(sim.frame_rate(), Some(5.0));
        assert_eq!(sim.exposure_ms(), Some(40.0));
    }

    #[test]
    fn attribute_ops_fail_after_disconnect() {
        let sim = SimulatedCamera::new(SimConfig::default());
        let camera = connect(&sim, &config());
        camera.disconnect();

        assert!(camera.set_frame_rate(5.0).is_err());
        assert_eq!(camera.poll(None), Err(PollError::StreamClosed));
    }
}
