use std::{
    thread,
    time::{Duration, Instant},
};

use super::{Backoff, CancelToken, FpsGauge, FpsMeter};
use crate::{
    osc::{self, SignalSink},
    pipeline::{Detectors, FrameSource, LandmarkDetector},
    signals,
    types::{Frame, LandmarkSet},
};

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Messages sent for one processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub body_messages: usize,
    pub face_messages: usize,
}

/// Detect → derive → transmit for a single mirrored frame.
pub struct FramePipeline<'a> {
    detectors: Detectors,
    sink: &'a dyn SignalSink,
    cancel: &'a CancelToken,
}

impl<'a> FramePipeline<'a> {
    pub fn new(detectors: Detectors, sink: &'a dyn SignalSink, cancel: &'a CancelToken) -> Self {
        Self {
            detectors,
            sink,
            cancel,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> CycleReport {
        let body = detect(self.detectors.body.as_mut(), frame, "body");
        let face = detect(self.detectors.face.as_mut(), frame, "face");
        let mut report = CycleReport::default();

        if let Some(body) = body {
            let joints = signals::body_joints(&body);
            report.body_messages = self.transmit("body", &osc::body_messages(&joints));
        }

        if let Some(expression) = face.as_ref().and_then(signals::derive_expression) {
            report.face_messages = self.transmit("face", &osc::face_messages(&expression));
        }

        report
    }

    fn transmit(&self, modality: &str, messages: &[(String, f32)]) -> usize {
        // stop() may return while detection or a batch is still running
        let delivery = osc::send_batch(self.sink, messages, || !self.cancel.is_cancelled());
        if let Some(err) = delivery.first_error {
            log::warn!(
                "OSC send error ({modality}): {} of {} messages failed, first: {err}",
                delivery.failed,
                messages.len()
            );
        }
        delivery.sent
    }
}

fn detect(
    detector: Option<&mut Box<dyn LandmarkDetector>>,
    frame: &Frame,
    modality: &str,
) -> Option<LandmarkSet> {
    match detector?.detect(frame) {
        Ok(landmarks) => landmarks,
        Err(err) => {
            log::warn!("{modality} landmark detection failed: {err:?}");
            None
        }
    }
}

/// Run until `cancel` fires. Read failures are retried forever, delayed
/// according to `backoff` once they pile up.
pub fn run<C: FrameSource>(
    mut camera: C,
    detectors: Detectors,
    sink: &dyn SignalSink,
    cancel: &CancelToken,
    fps: &FpsGauge,
    backoff: &Backoff,
) {
    let mut pipeline = FramePipeline::new(detectors, sink, cancel);
    let mut meter = FpsMeter::new(Instant::now());
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
        let frame_start = Instant::now();
        let frame = match camera.read_frame() {
            Ok(frame) => {
                if failures > backoff.after_failures {
                    log::info!("camera recovered after {failures} failed reads");
                }
                failures = 0;
                frame
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay(failures);
                if delay.is_zero() {
                    log::warn!(
                        "failed to read frame (after {:?}): {err:?}",
                        frame_start.elapsed()
                    );
                } else {
                    if backoff.is_escalating(failures) {
                        log::warn!("camera keeps failing ({failures} reads), backing off: {err:?}");
                    } else {
                        log::debug!("failed to read frame #{failures}, retrying in {delay:?}");
                    }
                    sleep_unless_cancelled(delay, cancel);
                }
                continue;
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        let frame = match frame.mirrored() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("failed to mirror camera frame: {err:?}");
                continue;
            }
        };

        pipeline.process(&frame);

        if let Some(rate) = meter.tick(Instant::now()) {
            fps.set(rate);
            log::debug!("FPS: {rate:.1}");
        }
    }

    log::info!("capture loop exited");
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::osc::TransmitError;
    use crate::osc::testing::{FailingSink, RecordingSink};
    use crate::signals::fixtures;
    use crate::tracker::testing::{RecordingDetector, ScriptedCamera, ScriptedDetector, frame};

    /// Records messages and fires the cancel token once `after` have arrived.
    struct CancellingSink {
        inner: RecordingSink,
        cancel: CancelToken,
        after: usize,
    }

    impl SignalSink for CancellingSink {
        fn send(&self, address: &str, value: f32) -> Result<(), TransmitError> {
            self.inner.send(address, value)?;
            if self.inner.messages().len() >= self.after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    fn detectors(body: Option<LandmarkSet>, face: Option<LandmarkSet>) -> Detectors {
        Detectors {
            body: Some(Box::new(ScriptedDetector::always(body))),
            face: Some(Box::new(ScriptedDetector::always(face))),
        }
    }

    fn face() -> LandmarkSet {
        fixtures::face_with(|_| {})
    }

    #[test]
    fn test_both_modalities_sent() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let mut pipeline =
            FramePipeline::new(detectors(Some(fixtures::pose()), Some(face())), &sink, &cancel);

        let report = pipeline.process(&frame());
        assert_eq!(
            report,
            CycleReport {
                body_messages: 48,
                face_messages: 4
            }
        );
        assert_eq!(sink.count_prefix("/body/"), 48);
        assert_eq!(sink.count_prefix("/face/"), 4);
    }

    #[test]
    fn test_missing_body_still_sends_face() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let mut pipeline = FramePipeline::new(detectors(None, Some(face())), &sink, &cancel);

        pipeline.process(&frame());
        assert_eq!(sink.count_prefix("/body/"), 0);
        assert_eq!(sink.count_prefix("/face/"), 4);
    }

    #[test]
    fn test_body_error_does_not_block_face() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let detectors = Detectors {
            body: Some(Box::new(ScriptedDetector::failing())),
            face: Some(Box::new(ScriptedDetector::always(Some(face())))),
        };
        let mut pipeline = FramePipeline::new(detectors, &sink, &cancel);

        let report = pipeline.process(&frame());
        assert_eq!(report.body_messages, 0);
        assert_eq!(report.face_messages, 4);
    }

    #[test]
    fn test_no_stale_values_between_frames() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let detectors = Detectors {
            body: Some(Box::new(ScriptedDetector::sequence(vec![
                Some(fixtures::pose()),
                None,
            ]))),
            face: None,
        };
        let mut pipeline = FramePipeline::new(detectors, &sink, &cancel);

        assert_eq!(pipeline.process(&frame()).body_messages, 48);
        sink.clear();
        assert_eq!(pipeline.process(&frame()).body_messages, 0);
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_face_values_reach_sink() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let face = fixtures::face_with(|p| {
            fixtures::set_y(p, fixtures::UPPER, 0.40);
            fixtures::set_y(p, fixtures::LOWER, 0.45);
        });
        let mut pipeline = FramePipeline::new(detectors(None, Some(face)), &sink, &cancel);
        pipeline.process(&frame());

        let messages = sink.messages();
        let (addr, value) = &messages[0];
        assert_eq!(addr, "/face/mouth_open");
        assert!((value - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_transport_failure_is_swallowed() {
        let cancel = CancelToken::new();
        let mut pipeline =
            FramePipeline::new(detectors(Some(fixtures::pose()), Some(face())), &FailingSink, &cancel);

        let first = pipeline.process(&frame());
        let second = pipeline.process(&frame());
        assert_eq!(first, CycleReport::default());
        assert_eq!(second, CycleReport::default());
    }

    #[test]
    fn test_cancelled_pipeline_sends_nothing() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut pipeline =
            FramePipeline::new(detectors(Some(fixtures::pose()), Some(face())), &sink, &cancel);

        assert_eq!(pipeline.process(&frame()), CycleReport::default());
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_cancel_mid_batch_stops_sending() {
        let cancel = CancelToken::new();
        let sink = CancellingSink {
            inner: RecordingSink::default(),
            cancel: cancel.clone(),
            after: 10,
        };
        let mut pipeline =
            FramePipeline::new(detectors(Some(fixtures::pose()), Some(face())), &sink, &cancel);

        let report = pipeline.process(&frame());
        assert_eq!(
            report,
            CycleReport {
                body_messages: 10,
                face_messages: 0
            }
        );
        assert_eq!(sink.inner.messages().len(), 10);
    }

    #[test]
    fn test_detectors_see_mirrored_frame() {
        let cancel = CancelToken::new();
        let body = RecordingDetector::default();
        let face = RecordingDetector::default();
        let red = [255, 0, 0];
        let blue = [0, 0, 255];
        let camera = ScriptedCamera::new(Arc::new(AtomicUsize::new(0)))
            .with_frame(Frame::new([red, blue].concat(), 2, 1))
            .cancel_after(2, cancel.clone());

        run(
            camera,
            Detectors {
                body: Some(Box::new(body.clone())),
                face: Some(Box::new(face.clone())),
            },
            &RecordingSink::default(),
            &cancel,
            &FpsGauge::default(),
            &Backoff::default(),
        );

        let expected = vec![[blue, red].concat()];
        assert_eq!(*body.seen.lock().unwrap(), expected);
        assert_eq!(*face.seen.lock().unwrap(), expected);
    }

    #[test]
    fn test_loop_survives_read_failures() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        let fps = FpsGauge::default();
        let reads = Arc::new(AtomicUsize::new(0));
        let camera = ScriptedCamera::new(reads.clone())
            .fail_first(8)
            .cancel_after(10, cancel.clone());
        let backoff = Backoff {
            after_failures: 2,
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };

        run(
            camera,
            detectors(Some(fixtures::pose()), None),
            &sink,
            &cancel,
            &fps,
            &backoff,
        );

        // 8 failures then 2 good frames; cancel fires during the 10th read
        assert_eq!(reads.load(Ordering::SeqCst), 10);
        assert_eq!(sink.count_prefix("/body/"), 48);
    }

    #[test]
    fn test_loop_exits_immediately_when_cancelled() {
        let sink = RecordingSink::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let reads = Arc::new(AtomicUsize::new(0));

        run(
            ScriptedCamera::new(reads.clone()),
            Detectors::default(),
            &sink,
            &cancel,
            &FpsGauge::default(),
            &Backoff::default(),
        );
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sleep_is_cut_short_by_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let start = Instant::now();
        sleep_unless_cancelled(Duration::from_secs(5), &cancel);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
