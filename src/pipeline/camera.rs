use anyhow::Result;
#[cfg(feature = "camera-nokhwa")]
use anyhow::{Context, anyhow};
#[cfg(feature = "camera-nokhwa")]
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

#[cfg(feature = "camera-nokhwa")]
use super::rgb_converter;
use crate::types::Frame;

/// An opened camera that yields frames one at a time.
///
/// Camera handles are not required to be `Send`: they are opened on the
/// capture thread and never leave it.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Opens cameras by index. Shared with the capture thread.
pub trait CameraOpener: Send + Sync + 'static {
    type Source: FrameSource;

    fn open(&self, index: u32) -> Result<Self::Source>;
}

// Prefer pixel formats that are widely supported on macOS (the built-in cameras
// often reject YUYV even though Nokhwa reports it).
#[cfg(feature = "camera-nokhwa")]
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

#[cfg(feature = "camera-nokhwa")]
fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[cfg(feature = "camera-nokhwa")]
#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

#[cfg(feature = "camera-nokhwa")]
pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .map(|info| CameraDevice {
            index: info.index().clone(),
            label: format_camera_label(&info),
        })
        .collect())
}

#[cfg(feature = "camera-nokhwa")]
fn format_camera_label(info: &CameraInfo) -> String {
    info.human_name()
}

#[cfg(feature = "camera-nokhwa")]
fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

#[cfg(feature = "camera-nokhwa")]
#[derive(Clone, Copy, Debug, Default)]
pub struct NokhwaOpener;

#[cfg(feature = "camera-nokhwa")]
impl CameraOpener for NokhwaOpener {
    type Source = NokhwaCamera;

    fn open(&self, index: u32) -> Result<NokhwaCamera> {
        let camera = build_camera(CameraIndex::Index(index))
            .with_context(|| format!("camera {index} unavailable"))?;
        let format = camera.camera_format();
        log::info!(
            "opened camera {index} ({}) at {}x{} {:?} @ {} fps",
            camera.info().human_name(),
            format.resolution().width_x,
            format.resolution().height_y,
            format.format(),
            format.frame_rate()
        );
        Ok(NokhwaCamera { camera })
    }
}

#[cfg(feature = "camera-nokhwa")]
pub struct NokhwaCamera {
    camera: Camera,
}

#[cfg(feature = "camera-nokhwa")]
impl FrameSource for NokhwaCamera {
    fn read_frame(&mut self) -> Result<Frame> {
        let buffer = self.camera.frame().context("camera frame read failed")?;
        let converted = rgb_converter::convert_camera_frame(&buffer)?;
        Ok(Frame::new(converted.rgb, converted.width, converted.height))
    }
}

#[cfg(feature = "camera-nokhwa")]
impl Drop for NokhwaCamera {
    fn drop(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            log::warn!("failed to stop camera stream: {err:?}");
        } else {
            log::debug!("camera stream released");
        }
    }
}
