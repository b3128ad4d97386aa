use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

/// The four networks behind body and face tracking: a region detector and a
/// landmark model per modality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    PersonDetector,
    Pose,
    FaceDetector,
    FaceMesh,
}

impl ModelKind {
    fn label(&self) -> &'static str {
        match self {
            ModelKind::PersonDetector => "person detector",
            ModelKind::Pose => "pose landmark",
            ModelKind::FaceDetector => "face detector",
            ModelKind::FaceMesh => "face mesh",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            ModelKind::PersonDetector => PERSON_DETECTOR_MODEL_FILENAME,
            ModelKind::Pose => POSE_MODEL_FILENAME,
            ModelKind::FaceDetector => FACE_DETECTOR_MODEL_FILENAME,
            ModelKind::FaceMesh => FACE_MESH_MODEL_FILENAME,
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            ModelKind::PersonDetector => PERSON_DETECTOR_MODEL_URL,
            ModelKind::Pose => POSE_MODEL_URL,
            ModelKind::FaceDetector => FACE_DETECTOR_MODEL_URL,
            ModelKind::FaceMesh => FACE_MESH_MODEL_URL,
        }
    }

    pub fn default_path(&self) -> PathBuf {
        PathBuf::from("models").join(self.file_name())
    }
}

const PERSON_DETECTOR_MODEL_FILENAME: &str = "person_detection_mediapipe_2023mar.onnx";
const PERSON_DETECTOR_MODEL_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/person_detection_mediapipe/person_detection_mediapipe_2023mar.onnx";
const POSE_MODEL_FILENAME: &str = "pose_estimation_mediapipe_2023mar.onnx";
const POSE_MODEL_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/pose_estimation_mediapipe/pose_estimation_mediapipe_2023mar.onnx";
const FACE_DETECTOR_MODEL_FILENAME: &str = "face_detection_back_256x256_float32_opt.onnx";
const FACE_DETECTOR_MODEL_URL: &str = "https://raw.githubusercontent.com/marcpabst/facetracking-rs/HEAD/src/face_detection/model_blazeface/assets/face_detection_back_256x256_float32_opt.onnx";
const FACE_MESH_MODEL_FILENAME: &str = "face_landmarks_detector.onnx";
const FACE_MESH_MODEL_URL: &str = "https://raw.githubusercontent.com/marcpabst/facetracking-rs/HEAD/src/face_landmarks/model_mediapipe/assets/face_landmarks_detector.onnx";

#[derive(Clone, Debug)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        model: ModelKind,
    },
    Started {
        model: ModelKind,
        total: Option<u64>,
    },
    Progress {
        model: ModelKind,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        model: ModelKind,
    },
}

/// Make sure `model_path` exists, downloading it from `url` when it does not.
pub fn ensure_model_ready<F>(
    model: ModelKind,
    model_path: &Path,
    url: Option<&str>,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(&ModelDownloadEvent),
{
    if model_path.exists() {
        on_event(&ModelDownloadEvent::AlreadyPresent { model });
        on_event(&ModelDownloadEvent::Finished { model });
        return Ok(());
    }

    let url = url.ok_or_else(|| {
        anyhow!(
            "{} model not found at {} and no download URL is configured",
            model.label(),
            model_path.display()
        )
    })?;

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    download_to_path(model, url, model_path, &mut |event| {
        match &event {
            ModelDownloadEvent::Started { total, .. } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished { .. } => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{} model ready", model.label()));
                }
            }
            ModelDownloadEvent::AlreadyPresent { .. } => {}
        }
        on_event(&event);
    })
    .with_context(|| {
        format!(
            "failed to download {} model to {}",
            model.label(),
            model_path.display()
        )
    })
}

fn download_to_path<F>(
    model: ModelKind,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!(
        "downloading {} model from {url} to {}",
        model.label(),
        dest.display()
    );

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total_size = response.content_length();
    on_event(ModelDownloadEvent::Started {
        model,
        total: total_size,
    });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            model,
            downloaded,
            total: total_size,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move temp model {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelDownloadEvent::Finished { model });
    Ok(())
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading model")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
