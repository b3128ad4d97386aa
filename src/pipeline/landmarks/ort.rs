use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    LandmarkDetector,
    common::{self, ModelLayout},
    detection::{RegionDetector, pick_primary},
};
use crate::types::{Frame, LandmarkSet};

/// Two-stage landmarker: a region detector finds the subject, then the
/// landmark model runs on a rotated crop around it.
pub struct OrtLandmarker {
    detector: RegionDetector,
    session: Session,
    layout: ModelLayout,
    min_confidence: f32,
}

impl OrtLandmarker {
    pub fn new(
        detector: RegionDetector,
        model_path: &Path,
        layout: ModelLayout,
        min_confidence: f32,
    ) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!(
                    "failed to load {} model from {}",
                    layout.name,
                    model_path.display()
                )
            })?;

        Ok(Self {
            detector,
            session,
            layout,
            min_confidence,
        })
    }
}

impl LandmarkDetector for OrtLandmarker {
    fn detect(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>> {
        let regions = self.detector.detect(frame)?;
        let Some(region) = pick_primary(&regions) else {
            return Ok(None);
        };
        let roi = (self.layout.roi)(region);

        let (input, transform) =
            common::prepare_rotated_crop(frame, &roi, self.layout.input_size, self.layout.range)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .with_context(|| format!("failed to run {} session", self.layout.name))?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "{} model returned {} outputs, expected at least 2",
                self.layout.name,
                outputs.len()
            ));
        }

        let raw_score = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);
        let score = self.layout.score.to_probability(raw_score);
        if score < self.min_confidence {
            return Ok(None);
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        common::decode_landmarks(&flattened, &self.layout, &transform).map(Some)
    }
}
