// THEORY:
// Acquisition decouples the sensor's pace from the pipeline's pace. The
// sensor driver blocks until its next frame; the pipeline must never block on
// it. A dedicated thread therefore reads frames and publishes each one into a
// single-slot holder. The pipeline picks up whatever is newest.
//
// Key architectural principles:
// 1.  **Latest Wins**: The holder is a `tokio::sync::watch` channel. A publish
//     replaces the previous frame, readers never wait, and nothing queues up
//     behind a slow pipeline. Frames the pipeline was too slow for are dropped.
// 2.  **Fail Fast At Startup, Retry In Steady State**: `open()` runs on the
//     caller's thread before the worker exists, so a missing sensor is a
//     synchronous fatal error. Once running, a failed read is logged and
//     retried after a back-off.
// 3.  **Cooperative Shutdown**: One `CycleControl` flag stops both the worker
//     and the frame cycle. The worker also stops once every reader is gone.

use crate::core_modules::frame::RawDepthFrame;
use crate::error::{GeoboxError, Result};
use log::{info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Pause after a failed read before trying again.
pub const READ_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// The driver boundary: anything that can hand over depth frames.
pub trait DepthSensor {
    /// Prepares the device. Called once, before the first read.
    fn open(&mut self) -> Result<()>;
    /// Blocks until the next frame is available.
    fn read_frame(&mut self) -> Result<RawDepthFrame>;
    /// Fixed `(width, height)` of the depth stream.
    fn resolution(&self) -> (usize, usize);
}

/// Shared running flag for the frame cycle and the acquisition worker.
#[derive(Clone)]
pub struct CycleControl {
    running_tx: Arc<watch::Sender<bool>>,
}

impl CycleControl {
    pub fn new() -> Self {
        let (running_tx, _) = watch::channel(true);
        Self {
            running_tx: Arc::new(running_tx),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Asks everything holding this control to finish its current iteration
    /// and stop.
    pub fn stop(&self) {
        self.running_tx.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }
}

impl Default for CycleControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of the latest-frame slot.
pub struct FramePublisher {
    tx: watch::Sender<Option<Arc<RawDepthFrame>>>,
}

impl FramePublisher {
    /// Replaces whatever frame is in the slot.
    pub fn publish(&self, frame: RawDepthFrame) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// True once every `LatestFrame` reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side of the latest-frame slot.
#[derive(Clone)]
pub struct LatestFrame {
    rx: watch::Receiver<Option<Arc<RawDepthFrame>>>,
}

impl LatestFrame {
    /// Creates an empty slot.
    pub fn channel() -> (FramePublisher, LatestFrame) {
        let (tx, rx) = watch::channel(None);
        (FramePublisher { tx }, LatestFrame { rx })
    }

    /// The newest published frame, if any. Never blocks.
    pub fn latest(&mut self) -> Option<Arc<RawDepthFrame>> {
        self.rx.borrow_and_update().clone()
    }

    /// True once the publisher is gone and no new frame can arrive.
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

/// Owns the thread that drains a `DepthSensor` into a `LatestFrame` slot.
pub struct AcquisitionWorker {
    handle: Option<JoinHandle<u64>>,
}

impl AcquisitionWorker {
    /// Opens `sensor` on the calling thread, then starts the reader thread.
    /// An open failure is returned as `SensorInit` and nothing is spawned.
    pub fn spawn<S>(mut sensor: S, control: &CycleControl, retry_backoff: Duration) -> Result<(Self, LatestFrame)>
    where
        S: DepthSensor + Send + 'static,
    {
        sensor.open().map_err(|e| match e {
            GeoboxError::SensorInit(msg) => GeoboxError::SensorInit(msg),
            other => GeoboxError::SensorInit(other.to_string()),
        })?;
        let (width, height) = sensor.resolution();
        info!("depth sensor opened at {width}x{height}");

        let (publisher, latest) = LatestFrame::channel();
        let running = control.subscribe();
        let handle = std::thread::Builder::new()
            .name("geobox-acquisition".into())
            .spawn(move || acquisition_loop(sensor, publisher, running, retry_backoff))?;

        Ok((
            Self {
                handle: Some(handle),
            },
            latest,
        ))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Waits for the reader thread and returns how many frames it published.
    pub fn join(mut self) -> u64 {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(published)) => published,
            Some(Err(_)) => {
                warn!("acquisition thread panicked");
                0
            }
            None => 0,
        }
    }
}

fn acquisition_loop<S: DepthSensor>(
    mut sensor: S,
    publisher: FramePublisher,
    running: watch::Receiver<bool>,
    retry_backoff: Duration,
) -> u64 {
    let mut published = 0u64;
    while *running.borrow() && !publisher.is_closed() {
        match sensor.read_frame() {
            Ok(frame) => {
                publisher.publish(frame);
                published += 1;
            }
            Err(e) => {
                warn!("depth read failed, retrying in {retry_backoff:?}: {e}");
                std::thread::sleep(retry_backoff);
            }
        }
    }
    info!("acquisition stopped after {published} frames");
    published
}
