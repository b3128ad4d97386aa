//! Region detectors run ahead of the landmark models. Both are MediaPipe SSD
//! heads: per anchor, a box with keypoints and a score logit.

use std::{cmp::Ordering, path::Path};

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::common::{InputRange, LetterboxInfo, prepare_frame_with_size, sigmoid};
use crate::types::Frame;

const FACE_ROI_SCALE: f32 = 1.5;
const PERSON_ROI_SCALE: f32 = 1.25;
const NMS_THRESHOLD: f32 = 0.3;
const TOP_K: usize = 8;

#[derive(Clone, Debug)]
pub struct DetectorLayout {
    pub name: &'static str,
    pub input_size: u32,
    pub range: InputRange,
    /// One entry per SSD layer; neighbouring layers with the same stride
    /// share a feature map.
    pub strides: &'static [u32],
    pub keypoints: usize,
}

impl DetectorLayout {
    /// MediaPipe person detector. Keypoints: mid-hip, full-body circle point,
    /// mid-shoulder, upper-body circle point.
    pub fn person() -> Self {
        Self {
            name: "person detector",
            input_size: 224,
            range: InputRange::MinusOneToOne,
            strides: &[8, 16, 32, 32, 32],
            keypoints: 4,
        }
    }

    /// BlazeFace back-camera model. Keypoints: right eye, left eye, nose tip,
    /// mouth, right ear, left ear.
    pub fn face() -> Self {
        Self {
            name: "face detector",
            input_size: 256,
            range: InputRange::MinusOneToOne,
            strides: &[16, 32, 32, 32],
            keypoints: 6,
        }
    }

    fn features(&self) -> usize {
        4 + self.keypoints * 2
    }
}

/// One detection, in frame pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub bbox: [f32; 4],
    pub keypoints: Vec<(f32, f32)>,
    pub score: f32,
}

/// Rotated square handed to a landmark model, in frame pixels. `angle`
/// rotates the crop's axes clockwise in image space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Roi {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
}

/// Anchor centres for an SSD head with two fixed-size anchors per layer and
/// per feature-map cell.
pub fn ssd_anchors(input_size: u32, strides: &[u32]) -> Vec<[f32; 2]> {
    let mut anchors = Vec::new();
    let mut layer = 0;
    while layer < strides.len() {
        let stride = strides[layer];
        let mut next = layer;
        while next < strides.len() && strides[next] == stride {
            next += 1;
        }
        let per_cell = (next - layer) * 2;
        let cells = input_size.div_ceil(stride.max(1));
        for y in 0..cells {
            for x in 0..cells {
                let center = [
                    (x as f32 + 0.5) / cells as f32,
                    (y as f32 + 0.5) / cells as f32,
                ];
                anchors.extend(std::iter::repeat_n(center, per_cell));
            }
        }
        layer = next;
    }
    anchors
}

pub struct RegionDetector {
    session: Session,
    layout: DetectorLayout,
    anchors: Vec<[f32; 2]>,
    score_threshold: f32,
}

impl RegionDetector {
    pub fn new(model_path: &Path, layout: DetectorLayout, score_threshold: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!(
                    "failed to load {} from {}",
                    layout.name,
                    model_path.display()
                )
            })?;
        let anchors = ssd_anchors(layout.input_size, layout.strides);

        Ok(Self {
            session,
            layout,
            anchors,
            score_threshold,
        })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Region>> {
        let (input, letterbox) =
            prepare_frame_with_size(frame, self.layout.input_size, self.layout.range)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .with_context(|| format!("failed to run {} session", self.layout.name))?;

        // Some exports split boxes and scores per feature map; the pieces
        // come out in anchor order.
        let features = self.layout.features();
        let mut boxes = Vec::new();
        let mut scores = Vec::new();
        for idx in 0..outputs.len() {
            let array = outputs[idx].try_extract_array::<f32>()?;
            match array.shape().last().copied() {
                Some(1) => scores.extend(array.iter().copied()),
                Some(dim) if dim == features => boxes.extend(array.iter().copied()),
                _ => {
                    return Err(anyhow!(
                        "unexpected {} output shape {:?}",
                        self.layout.name,
                        array.shape()
                    ));
                }
            }
        }

        decode_regions(
            &boxes,
            &scores,
            &self.anchors,
            &self.layout,
            &letterbox,
            self.score_threshold,
        )
    }
}

fn decode_regions(
    boxes: &[f32],
    scores: &[f32],
    anchors: &[[f32; 2]],
    layout: &DetectorLayout,
    letterbox: &LetterboxInfo,
    score_threshold: f32,
) -> Result<Vec<Region>> {
    let features = layout.features();
    if scores.is_empty() || boxes.len() != scores.len() * features {
        return Err(anyhow!(
            "{} returned {} box values for {} scores",
            layout.name,
            boxes.len(),
            scores.len()
        ));
    }
    if scores.len() > anchors.len() {
        return Err(anyhow!(
            "{} returned {} anchors, expected {}",
            layout.name,
            scores.len(),
            anchors.len()
        ));
    }

    let input = layout.input_size as f32;
    let scale = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let pad_bias_x = letterbox.pad_x / letterbox.scale;
    let pad_bias_y = letterbox.pad_y / letterbox.scale;
    let to_frame = |delta: f32, anchor: f32, bias: f32| (delta / input + anchor) * scale - bias;

    let mut candidates = Vec::new();
    for (idx, (&raw_score, anchor)) in scores.iter().zip(anchors).enumerate() {
        let score = sigmoid(raw_score);
        if score < score_threshold {
            continue;
        }

        let raw = &boxes[idx * features..(idx + 1) * features];
        let cx = to_frame(raw[0], anchor[0], pad_bias_x);
        let cy = to_frame(raw[1], anchor[1], pad_bias_y);
        let hw = raw[2] / input * scale / 2.0;
        let hh = raw[3] / input * scale / 2.0;
        if hw <= 0.0 || hh <= 0.0 {
            continue;
        }

        let keypoints = raw[4..]
            .chunks_exact(2)
            .map(|kp| {
                (
                    to_frame(kp[0], anchor[0], pad_bias_x),
                    to_frame(kp[1], anchor[1], pad_bias_y),
                )
            })
            .collect();

        candidates.push(Region {
            bbox: [cx - hw, cy - hh, cx + hw, cy + hh],
            keypoints,
            score,
        });
    }

    let kept = nms(&candidates, NMS_THRESHOLD, TOP_K);
    Ok(kept
        .into_iter()
        .filter_map(|idx| candidates.get(idx).cloned())
        .collect())
}

pub fn pick_primary(regions: &[Region]) -> Option<&Region> {
    regions
        .iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
}

/// Square around the hip-to-head circle, turned so the body points up.
pub fn person_roi(region: &Region) -> Roi {
    match region.keypoints.as_slice() {
        [hip, top, ..] => {
            let (vx, vy) = (top.0 - hip.0, top.1 - hip.1);
            let radius = vx.hypot(vy);
            Roi {
                center: *hip,
                side: (radius * 2.0).max(1.0) * PERSON_ROI_SCALE,
                angle: vx.atan2(-vy),
            }
        }
        _ => box_roi(region, PERSON_ROI_SCALE),
    }
}

/// Enlarged face box, turned so the eyes are level.
pub fn face_roi(region: &Region) -> Roi {
    let mut roi = box_roi(region, FACE_ROI_SCALE);
    if let [right_eye, left_eye, ..] = region.keypoints.as_slice() {
        roi.angle = (left_eye.1 - right_eye.1).atan2(left_eye.0 - right_eye.0);
    }
    roi
}

fn box_roi(region: &Region, scale: f32) -> Roi {
    let [x1, y1, x2, y2] = region.bbox;
    Roi {
        center: ((x1 + x2) * 0.5, (y1 + y2) * 0.5),
        side: (x2 - x1).max(y2 - y1) * scale,
        angle: 0.0,
    }
}

fn nms(candidates: &[Region], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    'outer: for &idx in &order {
        for &k in &keep {
            if iou(&candidates[idx].bbox, &candidates[k].bbox) >= threshold {
                continue 'outer;
            }
        }
        keep.push(idx);
        if keep.len() >= top_k {
            break;
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
