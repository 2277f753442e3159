pub mod camera;
pub mod frame;

pub use camera::Camera;
pub use camera::CameraMetadata;
pub use frame::Frame;
