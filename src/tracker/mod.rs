//! Tracker lifecycle: owns the capture thread and its cancellation.

mod backoff;
mod capture_loop;
mod fps;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, bounded};
use thiserror::Error;

use crate::{
    osc::SignalSink,
    pipeline::{CameraOpener, DetectorProvider},
};

pub use self::backoff::Backoff;
use self::fps::{FpsGauge, FpsMeter};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("cannot open camera {index}")]
    CameraUnavailable {
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("camera {index} did not open within {timeout:?}")]
    OpenTimeout { index: u32, timeout: Duration },

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub open_timeout: Duration,
    pub stop_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(2),
            backoff: Backoff::default(),
        }
    }
}

/// Cooperative stop flag shared with one capture thread.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct Worker {
    cancel: CancelToken,
    handle: thread::JoinHandle<()>,
    // Disconnects when the capture thread exits.
    done_rx: crossbeam_channel::Receiver<()>,
}

/// Start/stop controller for the camera → landmarks → OSC pipeline.
pub struct BodyTracker<O, P, S>
where
    O: CameraOpener,
    P: DetectorProvider,
    S: SignalSink,
{
    opener: Arc<O>,
    provider: Arc<P>,
    sink: Arc<S>,
    settings: TrackerSettings,
    state: TrackerState,
    worker: Option<Worker>,
    // A loop that outlived its stop timeout, possibly still holding a camera.
    detached: Option<thread::JoinHandle<()>>,
    fps: FpsGauge,
}

impl<O, P, S> BodyTracker<O, P, S>
where
    O: CameraOpener,
    P: DetectorProvider,
    S: SignalSink,
{
    pub fn new(opener: O, provider: P, sink: S, settings: TrackerSettings) -> Self {
        Self {
            opener: Arc::new(opener),
            provider: Arc::new(provider),
            sink: Arc::new(sink),
            settings,
            state: TrackerState::Idle,
            worker: None,
            detached: None,
            fps: FpsGauge::default(),
        }
    }

    /// Open `camera_index` and start streaming.
    ///
    /// The camera is opened on the capture thread; this call waits up to the
    /// open timeout for the outcome. When opening fails the thread has
    /// already exited and the tracker stays idle. On timeout the thread is
    /// cancelled and left to release the camera once the open call returns.
    pub fn start(&mut self, camera_index: u32) -> Result<StartOutcome, TrackerError> {
        if self.is_running() {
            log::warn!("tracker already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        // A loop that died on its own still needs reaping.
        if self.worker.is_some() {
            self.stop();
        }
        if let Some(previous) = self.detached.take() {
            if previous.is_finished() {
                let _ = previous.join();
            } else {
                log::warn!(
                    "previous capture loop has not exited yet, camera {camera_index} may still be busy"
                );
            }
        }

        let cancel = CancelToken::new();
        let (open_tx, open_rx) = bounded::<anyhow::Result<()>>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let opener = self.opener.clone();
        let provider = self.provider.clone();
        let sink = self.sink.clone();
        let loop_cancel = cancel.clone();
        let fps = self.fps.clone();
        let backoff = self.settings.backoff.clone();

        let handle = thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || {
                let _done = done_tx;

                let camera = match opener.open(camera_index) {
                    Ok(camera) => {
                        let _ = open_tx.send(Ok(()));
                        camera
                    }
                    Err(err) => {
                        let _ = open_tx.send(Err(err));
                        return;
                    }
                };
                // start() gave up waiting for the open
                if loop_cancel.is_cancelled() {
                    return;
                }

                let detectors = provider.build();
                capture_loop::run(
                    camera,
                    detectors,
                    sink.as_ref(),
                    &loop_cancel,
                    &fps,
                    &backoff,
                );
            })
            .map_err(TrackerError::Spawn)?;

        let opened = match open_rx.recv_timeout(self.settings.open_timeout) {
            Ok(opened) => opened,
            Err(RecvTimeoutError::Disconnected) => Err(anyhow::anyhow!(
                "capture thread exited before opening the camera"
            )),
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                self.detached = Some(handle);
                log::error!(
                    "camera {camera_index} did not open within {:?}",
                    self.settings.open_timeout
                );
                return Err(TrackerError::OpenTimeout {
                    index: camera_index,
                    timeout: self.settings.open_timeout,
                });
            }
        };

        match opened {
            Ok(()) => {
                self.worker = Some(Worker {
                    cancel,
                    handle,
                    done_rx,
                });
                self.state = TrackerState::Running;
                log::info!("camera started (ID: {camera_index})");
                Ok(StartOutcome::Started)
            }
            Err(source) => {
                if handle.join().is_err() {
                    log::error!("capture thread panicked while opening camera {camera_index}");
                }
                log::error!("cannot open camera {camera_index}: {source:#}");
                Err(TrackerError::CameraUnavailable {
                    index: camera_index,
                    source,
                })
            }
        }
    }

    /// Stop streaming. Safe to call at any time, any number of times.
    ///
    /// Waits up to the configured timeout for the capture thread. A thread
    /// that does not finish in time is detached; it will not transmit again
    /// and drops the camera as soon as its current call returns.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            self.state = TrackerState::Idle;
            return;
        };

        self.state = TrackerState::Stopping;
        worker.cancel.cancel();

        match worker.done_rx.recv_timeout(self.settings.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "capture loop did not exit within {:?}, detaching it",
                    self.settings.stop_timeout
                );
                self.detached = Some(worker.handle);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("capture loop panicked");
                }
            }
        }

        self.fps.set(0.0);
        self.state = TrackerState::Idle;
        log::info!("camera stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state == TrackerState::Running
            && self
                .worker
                .as_ref()
                .is_some_and(|worker| !worker.handle.is_finished())
    }

    #[allow(dead_code)]
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Most recent frames-per-second estimate, 0 until the first full second.
    pub fn fps(&self) -> f32 {
        self.fps.get()
    }
}

impl<O, P, S> Drop for BodyTracker<O, P, S>
where
    O: CameraOpener,
    P: DetectorProvider,
    S: SignalSink,
{
    fn drop(&mut self) {
        self.stop();
    }
}
