use std::time::Instant;

use anyhow::{Result, anyhow};
use image::{RgbImage, imageops};

/// A single packed RGB8 camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    #[allow(dead_code)]
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgb: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgb,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    /// Flip the frame left-right so landmarks come out in mirror coordinates.
    pub fn mirrored(self) -> Result<Frame> {
        let Frame {
            rgb,
            width,
            height,
            timestamp,
        } = self;
        let len = rgb.len();
        let mut image = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
            anyhow!(
                "frame buffer size mismatch: got {len}, expected {}",
                width as usize * height as usize * 3
            )
        })?;
        imageops::flip_horizontal_in_place(&mut image);

        Ok(Frame {
            rgb: image.into_raw(),
            width,
            height,
            timestamp,
        })
    }
}

/// A detected keypoint in normalized image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }
}

/// Landmarks for one detected body or face, in the detector's index order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LandmarkSet {
    landmarks: Vec<Landmark>,
}

impl LandmarkSet {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BodyPart {
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl BodyPart {
    pub const ALL: [BodyPart; 12] = [
        BodyPart::LeftShoulder,
        BodyPart::RightShoulder,
        BodyPart::LeftElbow,
        BodyPart::RightElbow,
        BodyPart::LeftWrist,
        BodyPart::RightWrist,
        BodyPart::LeftHip,
        BodyPart::RightHip,
        BodyPart::LeftKnee,
        BodyPart::RightKnee,
        BodyPart::LeftAnkle,
        BodyPart::RightAnkle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BodyPart::LeftShoulder => "left_shoulder",
            BodyPart::RightShoulder => "right_shoulder",
            BodyPart::LeftElbow => "left_elbow",
            BodyPart::RightElbow => "right_elbow",
            BodyPart::LeftWrist => "left_wrist",
            BodyPart::RightWrist => "right_wrist",
            BodyPart::LeftHip => "left_hip",
            BodyPart::RightHip => "right_hip",
            BodyPart::LeftKnee => "left_knee",
            BodyPart::RightKnee => "right_knee",
            BodyPart::LeftAnkle => "left_ankle",
            BodyPart::RightAnkle => "right_ankle",
        }
    }

    /// Index into the 33-point MediaPipe pose topology.
    pub fn landmark_index(&self) -> usize {
        match self {
            BodyPart::LeftShoulder => 11,
            BodyPart::RightShoulder => 12,
            BodyPart::LeftElbow => 13,
            BodyPart::RightElbow => 14,
            BodyPart::LeftWrist => 15,
            BodyPart::RightWrist => 16,
            BodyPart::LeftHip => 23,
            BodyPart::RightHip => 24,
            BodyPart::LeftKnee => 25,
            BodyPart::RightKnee => 26,
            BodyPart::LeftAnkle => 27,
            BodyPart::RightAnkle => 28,
        }
    }
}

/// One body joint as emitted downstream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointSample {
    pub part: BodyPart,
    pub landmark: Landmark,
}

impl JointSample {
    pub fn channels(&self) -> [(&'static str, f32); 4] {
        [
            ("x", self.landmark.x),
            ("y", self.landmark.y),
            ("z", self.landmark.z),
            ("visibility", self.landmark.visibility),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExpressionSignal {
    MouthOpen,
    Smile,
    BlinkLeft,
    BlinkRight,
}

impl ExpressionSignal {
    pub const ALL: [ExpressionSignal; 4] = [
        ExpressionSignal::MouthOpen,
        ExpressionSignal::Smile,
        ExpressionSignal::BlinkLeft,
        ExpressionSignal::BlinkRight,
    ];

    pub fn address(&self) -> &'static str {
        match self {
            ExpressionSignal::MouthOpen => "/face/mouth_open",
            ExpressionSignal::Smile => "/face/smile",
            ExpressionSignal::BlinkLeft => "/face/blink_left",
            ExpressionSignal::BlinkRight => "/face/blink_right",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FaceExpression {
    pub mouth_open: f32,
    pub smile: f32,
    pub blink_left: f32,
    pub blink_right: f32,
}

impl FaceExpression {
    pub fn value(&self, signal: ExpressionSignal) -> f32 {
        match signal {
            ExpressionSignal::MouthOpen => self.mouth_open,
            ExpressionSignal::Smile => self.smile,
            ExpressionSignal::BlinkLeft => self.blink_left,
            ExpressionSignal::BlinkRight => self.blink_right,
        }
    }
}
