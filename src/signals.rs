//! Landmark sets to body joint samples and facial expression scalars.
//!
//! Face indices follow the 468-point MediaPipe face mesh. The scale factors
//! are calibrated against the downstream avatar rig and must stay as they are.

use crate::types::{BodyPart, FaceExpression, JointSample, Landmark, LandmarkSet};

const UPPER_LIP: usize = 13;
const LOWER_LIP: usize = 14;
const LEFT_MOUTH_CORNER: usize = 61;
const RIGHT_MOUTH_CORNER: usize = 291;
const LEFT_EYE_TOP: usize = 159;
const LEFT_EYE_BOTTOM: usize = 145;
const RIGHT_EYE_TOP: usize = 386;
const RIGHT_EYE_BOTTOM: usize = 374;

const MOUTH_OPEN_SCALE: f32 = 10.0;
const SMILE_SCALE: f32 = 5.0;
const SMILE_BASELINE_Y: f32 = 0.5;
const EYE_OPEN_SCALE: f32 = 20.0;

pub fn mouth_open(upper_lip: &Landmark, lower_lip: &Landmark) -> f32 {
    (upper_lip.y - lower_lip.y).abs() * MOUTH_OPEN_SCALE
}

/// Positive when the mouth corners sit above the vertical midline of the image.
pub fn smile(left_corner: &Landmark, right_corner: &Landmark) -> f32 {
    let corner_y = (left_corner.y + right_corner.y) / 2.0;
    ((SMILE_BASELINE_Y - corner_y) * SMILE_SCALE).max(0.0)
}

/// Close to 1 for a closed eye, 0 once the lid gap reaches `1 / EYE_OPEN_SCALE`.
pub fn blink(lid_top: &Landmark, lid_bottom: &Landmark) -> f32 {
    let openness = (lid_top.y - lid_bottom.y).abs() * EYE_OPEN_SCALE;
    (1.0 - openness).max(0.0)
}

/// Returns `None` when the set does not carry every index the signals need.
pub fn derive_expression(face: &LandmarkSet) -> Option<FaceExpression> {
    Some(FaceExpression {
        mouth_open: mouth_open(face.get(UPPER_LIP)?, face.get(LOWER_LIP)?),
        smile: smile(face.get(LEFT_MOUTH_CORNER)?, face.get(RIGHT_MOUTH_CORNER)?),
        blink_left: blink(face.get(LEFT_EYE_TOP)?, face.get(LEFT_EYE_BOTTOM)?),
        blink_right: blink(face.get(RIGHT_EYE_TOP)?, face.get(RIGHT_EYE_BOTTOM)?),
    })
}

pub fn body_joints(body: &LandmarkSet) -> Vec<JointSample> {
    BodyPart::ALL
        .iter()
        .filter_map(|&part| {
            body.get(part.landmark_index())
                .map(|&landmark| JointSample { part, landmark })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_mouth_open_from_lip_gap() {
        let face = face_with(|p| {
            set_y(p, UPPER, 0.40);
            set_y(p, LOWER, 0.45);
        });
        let expr = derive_expression(&face).unwrap();
        assert!(close(expr.mouth_open, 0.5), "got {}", expr.mouth_open);
    }

    #[test]
    fn test_mouth_open_is_monotonic() {
        let mut last = -1.0;
        for step in 0..20 {
            let gap = step as f32 * 0.01;
            let face = face_with(|p| {
                set_y(p, UPPER, 0.40);
                set_y(p, LOWER, 0.40 + gap);
            });
            let value = derive_expression(&face).unwrap().mouth_open;
            assert!(value >= 0.0);
            assert!(value > last);
            last = value;
        }
    }

    #[test]
    fn test_smile_from_corner_height() {
        let face = face_with(|p| {
            set_y(p, CORNER_L, 0.45);
            set_y(p, CORNER_R, 0.47);
        });
        let expr = derive_expression(&face).unwrap();
        assert!(close(expr.smile, 0.2), "got {}", expr.smile);
    }

    #[test]
    fn test_smile_zero_at_or_below_midline() {
        for y in [0.5, 0.55, 0.9] {
            let face = face_with(|p| {
                set_y(p, CORNER_L, y);
                set_y(p, CORNER_R, y);
            });
            assert_eq!(derive_expression(&face).unwrap().smile, 0.0);
        }

        let face = face_with(|p| {
            set_y(p, CORNER_L, 0.49);
            set_y(p, CORNER_R, 0.49);
        });
        assert!(derive_expression(&face).unwrap().smile > 0.0);
    }

    #[test]
    fn test_blink_range() {
        // gap of 0.06 * 20 = 1.2 openness, fully open
        let open = derive_expression(&face_with(|_| {})).unwrap();
        assert_eq!(open.blink_left, 0.0);
        assert_eq!(open.blink_right, 0.0);

        let closed = face_with(|p| {
            set_y(p, LEFT_TOP, 0.33);
            set_y(p, LEFT_BOTTOM, 0.33);
            set_y(p, RIGHT_TOP, 0.33);
            set_y(p, RIGHT_BOTTOM, 0.335);
        });
        let expr = derive_expression(&closed).unwrap();
        assert!(close(expr.blink_left, 1.0));
        assert!(close(expr.blink_right, 0.9), "got {}", expr.blink_right);
    }

    #[test]
    fn test_blink_is_independent_per_eye() {
        let face = face_with(|p| {
            set_y(p, LEFT_TOP, 0.33);
            set_y(p, LEFT_BOTTOM, 0.33);
        });
        let expr = derive_expression(&face).unwrap();
        assert!(close(expr.blink_left, 1.0));
        assert_eq!(expr.blink_right, 0.0);
    }

    #[test]
    fn test_short_face_set_yields_nothing() {
        let face = LandmarkSet::new(vec![Landmark::default(); 100]);
        assert!(derive_expression(&face).is_none());
    }

    #[test]
    fn test_body_joints_cover_all_parts() {
        let joints = body_joints(&pose());
        assert_eq!(joints.len(), 12);
        assert_eq!(joints[0].part, BodyPart::LeftShoulder);
        assert!(close(joints[0].landmark.x, 0.11));
        assert_eq!(joints[11].part, BodyPart::RightAnkle);
        assert!(close(joints[11].landmark.x, 0.28));
        assert!(close(joints[11].landmark.visibility, 0.9));
    }

    #[test]
    fn test_body_joints_skip_missing_indices() {
        let partial = LandmarkSet::new(vec![Landmark::default(); 20]);
        let joints = body_joints(&partial);
        assert_eq!(joints.len(), 6);
        assert!(joints.iter().all(|j| j.part.landmark_index() < 20));
    }
}
