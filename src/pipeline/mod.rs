pub mod camera;
pub mod landmarks;
#[cfg(feature = "camera-nokhwa")]
pub mod rgb_converter;

// Re-exports for convenience
pub use camera::{CameraOpener, FrameSource};
#[cfg(feature = "camera-nokhwa")]
pub use camera::{NokhwaOpener, available_cameras};
pub use landmarks::{DetectorProvider, Detectors, LandmarkDetector, OrtBackend};
