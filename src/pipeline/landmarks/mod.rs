mod common;
mod detection;
mod ort;

use std::path::Path;

use crate::{
    config::ModelConfig,
    model_download::{ModelKind, ensure_model_ready},
    types::{Frame, LandmarkSet},
};

use self::common::ModelLayout;
use self::detection::{DetectorLayout, RegionDetector};
use self::ort::OrtLandmarker;

/// A landmark model invoked once per frame. `Ok(None)` means nothing was
/// found in this frame, which is not an error.
pub trait LandmarkDetector: Send + 'static {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<LandmarkSet>>;
}

/// The detectors owned by one capture loop. A missing detector disables its
/// modality without affecting the other.
#[derive(Default)]
pub struct Detectors {
    pub body: Option<Box<dyn LandmarkDetector>>,
    pub face: Option<Box<dyn LandmarkDetector>>,
}

/// Builds fresh detectors each time the tracker starts.
pub trait DetectorProvider: Send + Sync + 'static {
    fn build(&self) -> Detectors;
}

impl<F> DetectorProvider for F
where
    F: Fn() -> Detectors + Send + Sync + 'static,
{
    fn build(&self) -> Detectors {
        self()
    }
}

/// A model file and where to fetch it from.
struct ModelSource<'a> {
    kind: ModelKind,
    path: &'a Path,
    url: Option<&'a str>,
}

impl ModelSource<'_> {
    fn ensure(&self) -> anyhow::Result<()> {
        ensure_model_ready(self.kind, self.path, self.url, |evt| log::debug!("{evt:?}"))
    }
}

#[derive(Clone, Debug)]
pub struct OrtBackend {
    models: ModelConfig,
}

impl OrtBackend {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            models: config.clone(),
        }
    }

    fn load(
        &self,
        detector: ModelSource<'_>,
        detector_layout: DetectorLayout,
        landmarks: ModelSource<'_>,
        layout: ModelLayout,
        min_confidence: f32,
    ) -> Option<Box<dyn LandmarkDetector>> {
        let name = layout.name;
        for source in [&detector, &landmarks] {
            if let Err(err) = source.ensure() {
                log::error!("{name} tracking disabled: {err:?}");
                return None;
            }
        }

        let built = RegionDetector::new(detector.path, detector_layout, min_confidence)
            .and_then(|regions| OrtLandmarker::new(regions, landmarks.path, layout, min_confidence));
        match built {
            Ok(landmarker) => {
                log::info!(
                    "{name} landmarker ready using {} and {}",
                    detector.path.display(),
                    landmarks.path.display()
                );
                Some(Box::new(landmarker))
            }
            Err(err) => {
                log::error!("failed to load {name} landmarker: {err:?}");
                None
            }
        }
    }
}

impl DetectorProvider for OrtBackend {
    fn build(&self) -> Detectors {
        let models = &self.models;
        Detectors {
            body: self.load(
                ModelSource {
                    kind: ModelKind::PersonDetector,
                    path: &models.person_detector_model,
                    url: models.person_detector_model_url.as_deref(),
                },
                DetectorLayout::person(),
                ModelSource {
                    kind: ModelKind::Pose,
                    path: &models.pose_model,
                    url: models.pose_model_url.as_deref(),
                },
                ModelLayout::pose(),
                models.min_pose_confidence,
            ),
            face: self.load(
                ModelSource {
                    kind: ModelKind::FaceDetector,
                    path: &models.face_detector_model,
                    url: models.face_detector_model_url.as_deref(),
                },
                DetectorLayout::face(),
                ModelSource {
                    kind: ModelKind::FaceMesh,
                    path: &models.face_model,
                    url: models.face_model_url.as_deref(),
                },
                ModelLayout::face_mesh(),
                models.min_face_confidence,
            ),
        }
    }
}
