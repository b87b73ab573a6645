//! Frame Source: a capture thread feeding a latest-frame cell and a
//! capacity-1 queue.
//!
//! The producer never blocks on a slow consumer. When the queue is full it
//! drops the queued frame and enqueues the new one, so a consumer is at most
//! one frame behind. A read failure releases the device, waits out the
//! backoff, and reopens it; the loop only ends on [`FrameSource::stop`].

use crate::camera::{DeviceOpener, VideoDevice};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use faceid_core::session::FrameFeed;
use faceid_core::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SourceConfig {
    /// Wait after a failed open or read before trying the device again.
    pub reopen_backoff: Duration,
    /// Pause between successful reads.
    pub capture_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            reopen_backoff: Duration::from_millis(2000),
            capture_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub open_failures: u64,
    pub reopens: u64,
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
    open_failures: AtomicU64,
    reopens: AtomicU64,
}

pub struct FrameSource {
    shared: Arc<Shared>,
    queue: Receiver<Arc<Frame>>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Spawn the capture thread. The device is opened on that thread.
    pub fn start(opener: impl DeviceOpener, config: SourceConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let (frame_tx, frame_rx) = bounded::<Arc<Frame>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let worker = CaptureLoop {
            opener,
            config,
            shared: Arc::clone(&shared),
            frame_tx,
            drain: frame_rx.clone(),
            shutdown: shutdown_rx,
        };

        let thread = std::thread::Builder::new()
            .name("faceid-capture".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            queue: frame_rx,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// The most recent captured frame, without waiting.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait up to `timeout` for the queued frame.
    pub fn next_frame(&self, timeout: Duration) -> Option<Arc<Frame>> {
        self.queue.recv_timeout(timeout).ok()
    }

    /// Drop the queued frame, if any.
    pub fn clear(&self) {
        while self.queue.try_recv().is_ok() {}
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            open_failures: self.shared.open_failures.load(Ordering::Relaxed),
            reopens: self.shared.reopens.load(Ordering::Relaxed),
        }
    }

    /// Stop the capture thread and wait for it to release the device.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the shutdown channel.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FrameFeed for FrameSource {
    fn next_frame(&self, timeout: Duration) -> Option<Arc<Frame>> {
        FrameSource::next_frame(self, timeout)
    }

    fn clear(&self) {
        FrameSource::clear(self)
    }
}

struct CaptureLoop<O> {
    opener: O,
    config: SourceConfig,
    shared: Arc<Shared>,
    frame_tx: Sender<Arc<Frame>>,
    /// Receiver clone used to evict the queued frame when the queue is full.
    drain: Receiver<Arc<Frame>>,
    shutdown: Receiver<()>,
}

impl<O: DeviceOpener> CaptureLoop<O> {
    fn run(self) {
        let source = self.opener.describe();
        tracing::info!(device = %source, "capture thread started");

        let mut device: Option<Box<dyn VideoDevice>> = None;
        let mut ever_opened = false;
        let mut sequence = 0u32;

        while !self.wait_for_shutdown(Duration::ZERO) {
            if device.is_none() {
                match self.opener.open() {
                    Ok(dev) => {
                        if ever_opened {
                            self.shared.reopens.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(device = %source, "camera reopened");
                        }
                        ever_opened = true;
                        device = Some(dev);
                    }
                    Err(e) => {
                        self.shared.open_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(device = %source, error = %e, "camera open failed; retrying");
                        if self.wait_for_shutdown(self.config.reopen_backoff) {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(dev) = device.as_mut() else {
                continue;
            };

            match dev.read_frame() {
                Ok(image) => {
                    sequence = sequence.wrapping_add(1);
                    self.publish(Arc::new(Frame::new(image, sequence)));
                }
                Err(e) => {
                    self.shared.read_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(device = %source, error = %e, "frame read failed; releasing device");
                    device = None;
                    if self.wait_for_shutdown(self.config.reopen_backoff) {
                        break;
                    }
                    continue;
                }
            }

            if !self.config.capture_interval.is_zero() && self.wait_for_shutdown(self.config.capture_interval) {
                break;
            }
        }

        tracing::info!(device = %source, "capture thread exiting");
    }

    fn publish(&self, frame: Arc<Frame>) {
        *self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&frame));
        self.shared.frames_captured.fetch_add(1, Ordering::Relaxed);

        match self.frame_tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(frame)) => {
                // Evict the stale frame. If a consumer took it first, the
                // slot is free anyway.
                let _ = self.drain.try_recv();
                let _ = self.frame_tx.try_send(frame);
            }
        }
    }

    /// Sleep up to `timeout`; true once shutdown was requested.
    fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        match self.shutdown.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraError;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    /// Yields flat frames; fails every read after `fail_after` reads.
    struct FakeDevice {
        reads: usize,
        fail_after: Option<usize>,
        alive: Arc<AtomicBool>,
    }

    impl VideoDevice for FakeDevice {
        fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
            if self.fail_after.is_some_and(|n| self.reads >= n) {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            self.reads += 1;
            Ok(RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])))
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    struct FakeOpener {
        opens: Arc<AtomicUsize>,
        failing_opens: usize,
        fail_after: Option<usize>,
        alive: Arc<AtomicBool>,
    }

    impl FakeOpener {
        fn new() -> Self {
            Self {
                opens: Arc::default(),
                failing_opens: 0,
                fail_after: None,
                alive: Arc::default(),
            }
        }
    }

    impl DeviceOpener for FakeOpener {
        fn open(&self) -> Result<Box<dyn VideoDevice>, CameraError> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failing_opens {
                return Err(CameraError::DeviceBusy);
            }
            self.alive.store(true, Ordering::SeqCst);
            Ok(Box::new(FakeDevice {
                reads: 0,
                fail_after: self.fail_after,
                alive: Arc::clone(&self.alive),
            }))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    fn fast() -> SourceConfig {
        SourceConfig {
            reopen_backoff: Duration::from_millis(5),
            capture_interval: Duration::from_millis(1),
        }
    }

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_frames_flow() {
        let source = FrameSource::start(FakeOpener::new(), fast()).unwrap();
        let frame = source.next_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.image.dimensions(), (4, 4));
        assert!(source.latest_frame().is_some());
        assert!(source.stats().frames_captured >= 1);
    }

    #[test]
    fn test_queue_keeps_only_newest_frame() {
        let mut source = FrameSource::start(FakeOpener::new(), fast()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || source.stats().frames_captured >= 10));
        source.stop();

        let latest = source.latest_frame().unwrap();
        let queued = source.next_frame(Duration::ZERO).unwrap();
        assert_eq!(queued.sequence, latest.sequence);
        assert!(queued.sequence >= 10);
        assert!(source.next_frame(Duration::ZERO).is_none());
    }

    #[test]
    fn test_clear_empties_queue() {
        let mut source = FrameSource::start(FakeOpener::new(), fast()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || source.stats().frames_captured >= 1));
        source.stop();
        source.clear();
        assert!(source.next_frame(Duration::ZERO).is_none());
        assert!(source.latest_frame().is_some());
    }

    #[test]
    fn test_read_failure_reopens_device() {
        let opener = FakeOpener {
            fail_after: Some(3),
            ..FakeOpener::new()
        };
        let source = FrameSource::start(opener.clone(), fast()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || source.stats().reopens >= 2));
        let stats = source.stats();
        assert!(stats.read_failures >= 2);
        assert!(stats.frames_captured >= 6);
        assert!(opener.opens.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_open_failure_is_retried() {
        let opener = FakeOpener {
            failing_opens: 2,
            ..FakeOpener::new()
        };
        let source = FrameSource::start(opener, fast()).unwrap();

        assert!(source.next_frame(Duration::from_secs(2)).is_some());
        let stats = source.stats();
        assert_eq!(stats.open_failures, 2);
        assert_eq!(stats.reopens, 0);
    }

    #[test]
    fn test_drop_releases_device() {
        let opener = FakeOpener::new();
        let alive = Arc::clone(&opener.alive);
        let source = FrameSource::start(opener, fast()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || alive.load(Ordering::SeqCst)));

        drop(source);
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[test]
    fn test_feed_trait_delegates() {
        let source = FrameSource::start(FakeOpener::new(), fast()).unwrap();
        let feed: &dyn FrameFeed = &source;
        assert!(feed.next_frame(Duration::from_secs(2)).is_some());
        feed.clear();
    }
}
