use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use super::detection::{self, Region, Roi};
use crate::types::{Frame, Landmark, LandmarkSet};

/// Channel scaling a network was trained with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputRange {
    ZeroToOne,
    MinusOneToOne,
}

impl InputRange {
    fn scale(self, value: f32) -> f32 {
        match self {
            InputRange::ZeroToOne => value / 255.0,
            InputRange::MinusOneToOne => value / 127.5 - 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreKind {
    Probability,
    Logit,
}

impl ScoreKind {
    pub fn to_probability(self, raw: f32) -> f32 {
        match self {
            ScoreKind::Probability => raw.clamp(0.0, 1.0),
            ScoreKind::Logit => sigmoid(raw),
        }
    }
}

/// Tensor layout of a single-subject landmark model and how its input crop
/// is derived from a detected region.
#[derive(Clone, Debug)]
pub struct ModelLayout {
    pub name: &'static str,
    pub input_size: u32,
    pub range: InputRange,
    pub num_landmarks: usize,
    /// Values per landmark in the flat output.
    pub stride: usize,
    /// Offset of the visibility logit within a landmark, if the model has one.
    pub visibility_offset: Option<usize>,
    pub score: ScoreKind,
    pub roi: fn(&Region) -> Roi,
}

impl ModelLayout {
    /// MediaPipe BlazePose landmark model: 39 points of (x, y, z, visibility,
    /// presence), the first 33 of which are body landmarks.
    pub fn pose() -> Self {
        Self {
            name: "pose",
            input_size: 256,
            range: InputRange::ZeroToOne,
            num_landmarks: 33,
            stride: 5,
            visibility_offset: Some(3),
            score: ScoreKind::Probability,
            roi: detection::person_roi,
        }
    }

    /// MediaPipe face landmarker: 468 mesh points (478 with irises) of
    /// (x, y, z) and a face-presence logit.
    pub fn face_mesh() -> Self {
        Self {
            name: "face mesh",
            input_size: 256,
            range: InputRange::ZeroToOne,
            num_landmarks: 468,
            stride: 3,
            visibility_offset: None,
            score: ScoreKind::Logit,
            roi: detection::face_roi,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// A square, rotated window of the frame resampled to `output_size` pixels.
#[derive(Clone, Debug)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl CropTransform {
    /// Frame pixel position of a crop pixel position.
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let (sin, cos) = self.angle.sin_cos();
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }

    /// Map a landmark in crop pixels to coordinates normalized by the frame
    /// size. `z` shares the x scale, as MediaPipe defines it. Points outside
    /// the frame are kept as is.
    pub fn normalize(&self, x: f32, y: f32, z: f32) -> (f32, f32, f32) {
        let w = self.orig_w.max(1) as f32;
        let h = self.orig_h.max(1) as f32;
        let (px, py) = self.project(x, y);
        let scale = self.side / self.output_size as f32;
        (px / w, py / h, z * scale / w)
    }
}

pub fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

fn check_frame(frame: &Frame) -> Result<()> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(3);
    if frame.rgb.len() != expected_len || expected_len == 0 {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgb.len(),
            expected_len
        ));
    }
    Ok(())
}

/// Resize `frame` to fit a `target_size` square, pad with black, and build an
/// NHWC tensor scaled to `range`.
pub fn prepare_frame_with_size(
    frame: &Frame,
    target_size: u32,
    range: InputRange,
) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_frame(frame)?;

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round().max(1.0) as u32).min(target_size);
    let new_h = ((frame.height as f32 * scale).round().max(1.0) as u32).min(target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgb.clone(),
        fir::PixelType::U8x3,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x3);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size as i64 - new_w as i64) / 2).max(0) as usize;
    let pad_y = ((target_size as i64 - new_h as i64) / 2).max(0) as usize;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 3];
    let dst_stride = target_size as usize * 3;
    let src_stride = new_w as usize * 3;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 3;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_iter()
        .map(|&v| range.scale(v as f32))
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        normalized,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Resample the rotated square `roi` into an `output_size` NHWC tensor.
/// Pixels outside the frame are black.
pub fn prepare_rotated_crop(
    frame: &Frame,
    roi: &Roi,
    output_size: u32,
    range: InputRange,
) -> Result<(Array4<f32>, CropTransform)> {
    check_frame(frame)?;

    let transform = CropTransform {
        center: roi.center,
        side: roi.side,
        angle: roi.angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    let size = output_size as usize;
    let mut data = vec![0.0f32; size * size * 3];
    data.par_chunks_mut(size * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let (src_x, src_y) = transform.project(x as f32 + 0.5, y as f32 + 0.5);
                // pixel centres sit at +0.5
                let rgb = sample_rgb(frame, src_x - 0.5, src_y - 0.5);
                for (dst, value) in px.iter_mut().zip(rgb) {
                    *dst = range.scale(value);
                }
            }
        });

    let array = Array4::<f32>::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build crop tensor: {err}"))?;

    Ok((array, transform))
}

/// Bilinear sample in 0..=255 at fractional pixel coordinates.
fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if x.is_nan() || y.is_nan() {
        return [0.0; 3];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let (w, h) = (frame.width as i64, frame.height as i64);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let (ix, iy) = (cx as i64, cy as i64);
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0; 3];
        }
        let idx = ((iy * w + ix) * 3) as usize;
        [
            frame.rgb[idx] as f32,
            frame.rgb[idx + 1] as f32,
            frame.rgb[idx + 2] as f32,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x0 + 1.0, y0);
    let c01 = fetch(x0, y0 + 1.0);
    let c11 = fetch(x0 + 1.0, y0 + 1.0);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    std::array::from_fn(|c| {
        lerp(
            lerp(c00[c], c10[c], fx),
            lerp(c01[c], c11[c], fx),
            fy,
        )
    })
}

pub fn decode_landmarks(
    flat: &[f32],
    layout: &ModelLayout,
    transform: &CropTransform,
) -> Result<LandmarkSet> {
    let needed = layout.num_landmarks * layout.stride;
    if flat.len() < needed {
        return Err(anyhow!(
            "unexpected {} landmarks length: got {}, need {}",
            layout.name,
            flat.len(),
            needed
        ));
    }

    let landmarks = flat
        .chunks_exact(layout.stride)
        .take(layout.num_landmarks)
        .map(|chunk| {
            let (x, y, z) = transform.normalize(chunk[0], chunk[1], chunk[2]);
            let visibility = layout
                .visibility_offset
                .and_then(|offset| chunk.get(offset))
                .map(|&logit| sigmoid(logit))
                .unwrap_or(1.0);
            Landmark::new(x, y, z, visibility)
        })
        .collect();

    Ok(LandmarkSet::new(landmarks))
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn upright(center: (f32, f32), side: f32, output_size: u32, w: u32, h: u32) -> CropTransform {
        CropTransform {
            center,
            side,
            angle: 0.0,
            output_size,
            orig_w: w,
            orig_h: h,
        }
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let frame = Frame::new(vec![128; 8 * 4 * 3], 8, 4);
        let (input, letterbox) =
            prepare_frame_with_size(&frame, 4, InputRange::ZeroToOne).unwrap();

        assert_eq!(input.shape(), &[1, 4, 4, 3]);
        assert!(close(letterbox.scale, 0.5));
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 1.0);
        // top padding row stays black, image rows carry the gray value
        assert_eq!(input[[0, 0, 0, 0]], 0.0);
        assert!(close(input[[0, 1, 0, 0]], 128.0 / 255.0));
    }

    #[test]
    fn test_signed_input_range() {
        let frame = Frame::new(vec![255; 4 * 2 * 3], 4, 2);
        let (input, _) = prepare_frame_with_size(&frame, 4, InputRange::MinusOneToOne).unwrap();
        assert!(close(input[[0, 1, 1, 0]], 1.0));
        // black padding maps to the bottom of the range
        assert!(close(input[[0, 0, 0, 0]], -1.0));
    }

    #[test]
    fn test_prepare_rejects_bad_buffer() {
        let frame = Frame::new(vec![0; 10], 2, 2);
        assert!(prepare_frame_with_size(&frame, 4, InputRange::ZeroToOne).is_err());
        let roi = Roi {
            center: (1.0, 1.0),
            side: 2.0,
            angle: 0.0,
        };
        assert!(prepare_rotated_crop(&frame, &roi, 2, InputRange::ZeroToOne).is_err());
    }

    #[test]
    fn test_upright_crop_copies_pixels() {
        // 2x2: red, green / blue, white
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = Frame::new(rgb, 2, 2);
        let roi = Roi {
            center: (1.0, 1.0),
            side: 2.0,
            angle: 0.0,
        };
        let (input, _) = prepare_rotated_crop(&frame, &roi, 2, InputRange::ZeroToOne).unwrap();

        assert!(close(input[[0, 0, 0, 0]], 1.0));
        assert!(close(input[[0, 0, 1, 1]], 1.0));
        assert!(close(input[[0, 1, 0, 2]], 1.0));
        assert!(close(input[[0, 1, 0, 0]], 0.0));
    }

    #[test]
    fn test_half_turn_crop_reverses_pixels() {
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = Frame::new(rgb, 2, 2);
        let roi = Roi {
            center: (1.0, 1.0),
            side: 2.0,
            angle: PI,
        };
        let (input, _) = prepare_rotated_crop(&frame, &roi, 2, InputRange::ZeroToOne).unwrap();

        // top-left of the crop is the white bottom-right pixel
        assert!(close(input[[0, 0, 0, 0]], 1.0));
        assert!(close(input[[0, 0, 0, 1]], 1.0));
        assert!(close(input[[0, 0, 0, 2]], 1.0));
        // bottom-right of the crop is red
        assert!(close(input[[0, 1, 1, 0]], 1.0));
        assert!(close(input[[0, 1, 1, 1]], 0.0));
    }

    #[test]
    fn test_crop_outside_frame_is_black() {
        let frame = Frame::new(vec![200; 2 * 2 * 3], 2, 2);
        let roi = Roi {
            center: (50.0, 50.0),
            side: 2.0,
            angle: 0.0,
        };
        let (input, _) = prepare_rotated_crop(&frame, &roi, 2, InputRange::ZeroToOne).unwrap();
        assert!(input.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_normalize_undoes_crop() {
        let transform = upright((320.0, 240.0), 256.0, 256, 640, 480);
        let (x, y, z) = transform.normalize(128.0, 128.0, 64.0);
        assert!(close(x, 0.5));
        assert!(close(y, 0.5));
        assert!(close(z, 0.1));

        // half-size crop doubles offsets from the centre
        let transform = upright((320.0, 240.0), 128.0, 256, 640, 480);
        let (x, _, _) = transform.normalize(256.0, 128.0, 0.0);
        assert!(close(x, 384.0 / 640.0));
    }

    #[test]
    fn test_normalize_rotated_crop() {
        let transform = CropTransform {
            angle: PI / 2.0,
            ..upright((320.0, 240.0), 256.0, 256, 640, 480)
        };
        // crop +x points down the frame after a quarter turn
        let (x, y, _) = transform.normalize(256.0, 128.0, 0.0);
        assert!(close(x, 0.5));
        assert!(close(y, 368.0 / 480.0));
    }

    #[test]
    fn test_normalize_keeps_points_outside_frame() {
        let transform = upright((10.0, 10.0), 256.0, 256, 640, 480);
        let (x, y, _) = transform.normalize(0.0, 0.0, 0.0);
        assert!(x < 0.0);
        assert!(y < 0.0);
    }

    #[test]
    fn test_decode_pose_layout() {
        let layout = ModelLayout::pose();
        let transform = upright((128.0, 128.0), 256.0, 256, 256, 256);
        let mut flat = vec![0.0f32; 39 * 5];
        flat[11 * 5] = 64.0;
        flat[11 * 5 + 1] = 192.0;
        flat[11 * 5 + 3] = 0.0;

        let set = decode_landmarks(&flat, &layout, &transform).unwrap();
        assert_eq!(set.len(), 33);
        let shoulder = set.get(11).unwrap();
        assert!(close(shoulder.x, 0.25));
        assert!(close(shoulder.y, 0.75));
        assert!(close(shoulder.visibility, 0.5));
    }

    #[test]
    fn test_decode_face_mesh_accepts_iris_points() {
        let layout = ModelLayout::face_mesh();
        let transform = upright((128.0, 128.0), 256.0, 256, 256, 256);
        let set = decode_landmarks(&vec![128.0; 478 * 3], &layout, &transform).unwrap();
        assert_eq!(set.len(), 468);
        assert_eq!(set.get(0).unwrap().visibility, 1.0);
        assert!(close(set.get(467).unwrap().x, 0.5));

        assert!(decode_landmarks(&[0.0; 30], &layout, &transform).is_err());
    }

    #[test]
    fn test_score_kinds() {
        assert!(close(ScoreKind::Logit.to_probability(0.0), 0.5));
        assert_eq!(ScoreKind::Probability.to_probability(1.7), 1.0);
    }
}
