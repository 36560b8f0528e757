// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode-and-display pipeline.
//!
//! Three threads cooperate:
//!
//! * the feed thread reads NAL units from the source, groups them into access units, submits
//!   them to the [`DecodeSession`] and pushes decoded frames into the decoded queue,
//! * the render thread wraps decoded frames into framebuffers and hands them to the page-flip
//!   thread through a single-slot queue where the latest frame wins,
//! * the page-flip thread waits for each vblank and puts the latest frame on screen.
//!
//! Buffers the display is done with travel back to the feed thread through the returned queue
//! and are queued to the decoder again.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::decoder::DecodeBuffer;
use crate::decoder::DecodeSession;
use crate::decoder::DecoderError;
use crate::decoder::StatelessDecoderBackend;
use crate::decoder::SubmitResult;
use crate::display::DisplayBuffer;
use crate::display::DisplayDevice;
use crate::display::Presenter;
use crate::h264::AccessUnit;
use crate::h264::AccessUnitAssembler;
use crate::h264::NalSource;
use crate::h264::ParameterSetState;
use crate::pool::BufferPool;
use crate::queue::BoundedQueue;
use crate::queue::OverflowPolicy;
use crate::queue::PushOutcome;
use crate::queue::QueueError;
use crate::stats::PipelineStatistics;
use crate::stats::StatisticsSnapshot;

/// How long the feed thread waits on the decoder when it is busy.
const DECODER_POLL_TIMEOUT_MS: u16 = 10;
/// Wait between two checks for returned buffers when the decoder has no pollable descriptor.
const BUSY_BACKOFF: Duration = Duration::from_millis(1);
/// How long the feed thread waits for the display when the decoder has no CAPTURE buffer.
const RETURN_TIMEOUT: Duration = Duration::from_millis(DECODER_POLL_TIMEOUT_MS as u64);
/// Delay before retrying after a failed vblank wait.
const VBLANK_RETRY_DELAY: Duration = Duration::from_millis(16);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedStatus {
    Running,
    EndOfStream,
    Failed,
}

/// Progress of the feed thread, shared with the pipeline handle.
struct FeedProgress {
    status: Mutex<FeedStatus>,
    changed: Condvar,
}

impl FeedProgress {
    fn set(&self, status: FeedStatus) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }
}

/// Queues connecting the pipeline threads.
struct Queues {
    /// Decoded frames waiting for the render thread.
    decoded: BoundedQueue<DecodeBuffer>,
    /// Latest frame waiting for the next vblank.
    flip: BoundedQueue<DisplayBuffer>,
    /// Buffers the display is done with, to be queued to the decoder again.
    returned: BoundedQueue<DecodeBuffer>,
}

struct FeedThread<B: StatelessDecoderBackend, S: NalSource> {
    session: DecodeSession<B>,
    source: S,
    parameter_sets: ParameterSetState,
    assembler: AccessUnitAssembler,
    queues: Arc<Queues>,
    stats: Arc<PipelineStatistics>,
    cancel: Arc<AtomicBool>,
    /// How long frames still being decoded are waited for once cancelled.
    drain_timeout: Duration,
    output_buffers: usize,
    capture_buffers: usize,
}

impl<B: StatelessDecoderBackend, S: NalSource> FeedThread<B, S> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn run(&mut self, progress: &FeedProgress) -> Result<(), DecoderError> {
        while let Some(nal) = self.source.next_nal() {
            if self.cancelled() {
                break;
            }
            if let Some(au) = self.assembler.push(nal.clone(), &self.parameter_sets) {
                self.decode(au)?;
            }
            if let Err(e) = self.parameter_sets.process(&nal) {
                log::warn!("dropping invalid {:?} NAL unit: {}", nal.nalu_type(), e);
            }
        }

        if !self.cancelled() {
            if let Some(au) = self.assembler.flush() {
                self.decode(au)?;
            }
        }
        self.finish_pending()?;
        if self.cancelled() {
            log::debug!("decoding cancelled");
            return Ok(());
        }

        log::debug!("end of stream reached");
        progress.set(FeedStatus::EndOfStream);

        // Keep recycling buffers for the frames still being displayed.
        while !self.cancelled() {
            match self.queues.returned.pop(Some(DRAIN_POLL_INTERVAL)) {
                Ok(buffer) => self.session.requeue_capture_buffer(buffer)?,
                Err(QueueError::Timeout) => (),
                Err(QueueError::Closed) => break,
            }
        }

        Ok(())
    }

    /// Forward the frames still being decoded. Once cancelled, gives up after the drain timeout.
    fn finish_pending(&mut self) -> Result<(), DecoderError> {
        let drain_timeout = self.drain_timeout;
        let mut deadline = None;

        while self.session.pending_frames() > 0 {
            if self.cancelled() {
                let deadline = *deadline.get_or_insert_with(|| Instant::now() + drain_timeout);
                if Instant::now() >= deadline {
                    log::warn!(
                        "abandoning {} frames still being decoded",
                        self.session.pending_frames()
                    );
                    break;
                }
            }
            self.service()?;
            if self.session.pending_frames() > 0 {
                self.wait_for_decoder()?;
            }
        }
        self.service()?;

        Ok(())
    }

    fn decode(&mut self, au: AccessUnit) -> Result<(), DecoderError> {
        if !self.session.is_initialized() {
            let sps = match self.parameter_sets.sps() {
                Some(sps) => Arc::clone(sps),
                None => {
                    log::warn!("dropping access unit received before any SPS");
                    self.stats.record_decode_error();
                    return Ok(());
                }
            };
            self.session
                .initialize(self.output_buffers, self.capture_buffers, &sps)?;
        }

        loop {
            if self.cancelled() {
                return Ok(());
            }
            match self.session.submit_frame(&au.nals, &self.parameter_sets)? {
                SubmitResult::Submitted { timestamp } => {
                    log::trace!("submitted frame {}", timestamp);
                    break;
                }
                // Already logged and counted by the session.
                SubmitResult::FrameError(_) => break,
                SubmitResult::Busy => {
                    if !self.service()? {
                        self.wait_for_decoder()?;
                    }
                }
            }
        }

        self.service()?;
        Ok(())
    }

    /// Requeue returned buffers and forward decoded frames. Returns whether anything happened.
    fn service(&mut self) -> Result<bool, DecoderError> {
        let mut progress = false;

        while let Some(buffer) = self.queues.returned.try_pop() {
            self.session.requeue_capture_buffer(buffer)?;
            progress = true;
        }

        for frame in self.session.reclaim()? {
            progress = true;
            match self.queues.decoded.push(frame) {
                PushOutcome::Queued => (),
                PushOutcome::Dropped(dropped) => {
                    log::debug!("decoded queue full, dropping frame {}", dropped.timestamp());
                    self.stats.record_dropped();
                    self.session.requeue_capture_buffer(dropped)?;
                }
                PushOutcome::Closed(frame) => {
                    self.stats.record_dropped();
                    self.session.requeue_capture_buffer(frame)?;
                }
            }
        }

        Ok(progress)
    }

    fn wait_for_decoder(&mut self) -> Result<(), DecoderError> {
        // With no CAPTURE buffer queued only the display can make progress, and the device
        // reports an error right away when polled.
        let queued = self.session.queued_capture_buffers();
        if queued > 0 {
            if let Some(fd) = self.session.poll_fd() {
                let mut fds = [PollFd::new(
                    fd,
                    PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLPRI,
                )];
                if let Err(e) = poll(&mut fds, PollTimeout::from(DECODER_POLL_TIMEOUT_MS)) {
                    log::warn!("failed to poll decoder: {}", e);
                }
                return Ok(());
            }
        }

        let timeout = if queued == 0 {
            RETURN_TIMEOUT
        } else {
            BUSY_BACKOFF
        };
        if let Ok(buffer) = self.queues.returned.pop(Some(timeout)) {
            self.session.requeue_capture_buffer(buffer)?;
        }

        Ok(())
    }
}

/// Give a buffer back to the feed thread. The buffer is released if the pipeline is stopping.
fn return_buffer(queues: &Queues, buffer: DecodeBuffer) {
    if let PushOutcome::Closed(buffer) = queues.returned.push(buffer) {
        log::trace!("releasing buffer {} on shutdown", buffer.index());
    }
}

fn render_thread<D: DisplayDevice + ?Sized>(
    device: &D,
    queues: &Queues,
    stats: &PipelineStatistics,
) {
    loop {
        let buffer = match queues.decoded.pop(None) {
            Ok(buffer) => buffer,
            Err(QueueError::Timeout) => continue,
            Err(QueueError::Closed) => break,
        };

        let frame = match DisplayBuffer::import(device, buffer) {
            Ok(frame) => frame,
            Err((buffer, e)) => {
                log::warn!("failed to import frame {}: {}", buffer.timestamp(), e);
                stats.record_present_error();
                stats.record_dropped();
                return_buffer(queues, buffer);
                continue;
            }
        };

        match queues.flip.push(frame) {
            PushOutcome::Queued => (),
            PushOutcome::Dropped(superseded) | PushOutcome::Closed(superseded) => {
                log::trace!("frame {} superseded", superseded.buffer().timestamp());
                stats.record_dropped();
                return_buffer(queues, superseded.discard(device));
            }
        }
    }
}

fn flip_thread<D: DisplayDevice + ?Sized>(mut presenter: Presenter<D>, queues: &Queues) {
    loop {
        if let Err(e) = presenter.wait_vblank() {
            log::error!("failed to wait for vblank: {}", e);
            std::thread::sleep(VBLANK_RETRY_DELAY);
        }

        if let Some(frame) = queues.flip.try_pop() {
            presenter.present(frame);
        }
        for buffer in presenter.retired_buffers() {
            return_buffer(queues, buffer);
        }

        if queues.flip.is_closed() && queues.flip.is_empty() {
            break;
        }
    }

    for buffer in presenter.shutdown() {
        return_buffer(queues, buffer);
    }
}

/// A running decode-and-display pipeline.
///
/// Dropping the pipeline stops it.
pub struct Pipeline {
    stats: Arc<PipelineStatistics>,
    queues: Arc<Queues>,
    display: Arc<dyn DisplayDevice>,
    cancel: Arc<AtomicBool>,
    progress: Arc<FeedProgress>,
    drain_timeout: Duration,
    feed: Option<JoinHandle<Result<(), DecoderError>>>,
    render: Option<JoinHandle<()>>,
    flip: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Pipeline {
    /// Start decoding `source` with `backend` and presenting it on `display`.
    ///
    /// Fails if no display path can show the configured format.
    pub fn start<B, D, S>(
        config: &PipelineConfig,
        pool: Arc<BufferPool>,
        backend: B,
        display: Arc<D>,
        source: S,
    ) -> anyhow::Result<Self>
    where
        B: StatelessDecoderBackend + 'static,
        D: DisplayDevice + 'static,
        S: NalSource + 'static,
    {
        let stats = Arc::new(PipelineStatistics::new());
        let presenter = Presenter::new(Arc::clone(&display), &config.display, Arc::clone(&stats))
            .context("failed to set up the display")?;

        let queues = Arc::new(Queues {
            decoded: BoundedQueue::new(config.queue.capacity, config.queue.policy),
            flip: BoundedQueue::new(1, OverflowPolicy::DropOldest),
            // Large enough to hold every region of the pool, so returning never blocks.
            returned: BoundedQueue::new(pool.capacity(), OverflowPolicy::Block),
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(FeedProgress {
            status: Mutex::new(FeedStatus::Running),
            changed: Condvar::new(),
        });

        let mut pipeline = Pipeline {
            stats: Arc::clone(&stats),
            queues: Arc::clone(&queues),
            display: Arc::clone(&display) as Arc<dyn DisplayDevice>,
            cancel: Arc::clone(&cancel),
            progress: Arc::clone(&progress),
            drain_timeout: config.drain_timeout,
            feed: None,
            render: None,
            flip: None,
            stopped: false,
        };

        let flip_queues = Arc::clone(&queues);
        pipeline.flip = Some(
            std::thread::Builder::new()
                .name("hwdec-flip".into())
                .spawn(move || flip_thread(presenter, &flip_queues))
                .context("failed to spawn the page-flip thread")?,
        );

        let render_queues = Arc::clone(&queues);
        let render_stats = Arc::clone(&stats);
        pipeline.render = Some(
            std::thread::Builder::new()
                .name("hwdec-render".into())
                .spawn(move || render_thread(&*display, &render_queues, &render_stats))
                .context("failed to spawn the render thread")?,
        );

        let mut feed = FeedThread {
            session: DecodeSession::new(
                backend,
                pool,
                config.decoder.clone(),
                Arc::clone(&stats),
            ),
            source,
            parameter_sets: ParameterSetState::new(),
            assembler: AccessUnitAssembler::new(),
            queues,
            stats,
            cancel,
            drain_timeout: config.drain_timeout,
            output_buffers: config.decoder.output_buffers,
            capture_buffers: config.decoder.capture_buffers,
        };
        pipeline.feed = Some(
            std::thread::Builder::new()
                .name("hwdec-feed".into())
                .spawn(move || {
                    let res = feed.run(&progress);
                    if let Err(e) = &res {
                        log::error!("decoding stopped: {}", e);
                        progress.set(FeedStatus::Failed);
                    }
                    res
                })
                .context("failed to spawn the feed thread")?,
        );

        log::info!("pipeline started");
        Ok(pipeline)
    }

    /// Open the devices named in `config` and start presenting `source`.
    #[cfg(feature = "v4l2")]
    pub fn open<S: NalSource + 'static>(config: &PipelineConfig, source: S) -> anyhow::Result<Self> {
        use crate::decoder::v4l2::V4l2StatelessBackend;
        use crate::display::drm::DrmDevice;

        let pool = BufferPool::open(&config.pool).context("failed to open the buffer pool")?;
        let backend = V4l2StatelessBackend::open(&config.decoder)
            .context("failed to open the decoder")?;
        let display =
            DrmDevice::open(&config.display.card).context("failed to open the display")?;

        Self::start(config, Arc::new(pool), backend, Arc::new(display), source)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the whole source has been decoded and every decoded frame has been presented
    /// or dropped. Returns `false` on timeout or if decoding failed.
    pub fn wait_for_end_of_stream(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut status = self.progress.status.lock();
        while *status == FeedStatus::Running {
            if self
                .progress
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        if *status != FeedStatus::EndOfStream {
            return false;
        }
        drop(status);

        while self.stats.snapshot().in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        true
    }

    /// Stop decoding, let frames in flight reach the screen for up to the drain timeout, then
    /// release every resource. Calling it again does nothing.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.cancel.store(true, Ordering::Release);
        if let Some(feed) = self.feed.take() {
            // Decoding errors have already been logged by the thread.
            if feed.join().is_err() {
                log::error!("feed thread panicked");
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.stats.snapshot().in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        self.queues.decoded.close();
        if let Some(render) = self.render.take() {
            if render.join().is_err() {
                log::error!("render thread panicked");
            }
        }
        self.queues.flip.close();
        if let Some(flip) = self.flip.take() {
            if flip.join().is_err() {
                log::error!("page-flip thread panicked");
            }
        }
        self.queues.returned.close();

        for buffer in self.queues.decoded.drain() {
            log::trace!("dropping frame {} on shutdown", buffer.timestamp());
            self.stats.record_dropped();
        }
        for frame in self.queues.flip.drain() {
            self.stats.record_dropped();
            frame.discard(&*self.display);
        }
        self.queues.returned.drain();

        let stats = self.stats.snapshot();
        if stats.in_flight() > 0 {
            log::warn!("{} frames still in flight after stop", stats.in_flight());
        }
        log::info!(
            "pipeline stopped: {} decoded, {} presented, {} dropped, {} decode errors, {} present errors",
            stats.decoded,
            stats.presented,
            stats.dropped,
            stats.decode_errors,
            stats.present_errors
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::config::QueueConfig;
    use crate::decoder::dummy::DummyBackend;
    use crate::display::dummy::dummy_resources;
    use crate::display::dummy::DummyDisplay;
    use crate::display::DisplayError;
    use crate::fourcc;
    use crate::h264::testing::simple_stream;
    use crate::h264::NalUnit;
    use crate::memfd::MemFdAllocator;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(Arc::new(MemFdAllocator), 32))
    }

    fn config(policy: OverflowPolicy) -> PipelineConfig {
        PipelineConfig {
            decoder: DecoderConfig {
                max_slice_size: 4096,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 3,
                policy,
            },
            drain_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn drop_oldest_accounts_for_every_frame() {
        let display = Arc::new(DummyDisplay::nv12(Duration::from_millis(10)));
        let mut pipeline = Pipeline::start(
            &config(OverflowPolicy::DropOldest),
            pool(),
            DummyBackend::new(),
            Arc::clone(&display),
            simple_stream(1, 59).into_iter(),
        )
        .unwrap();

        assert!(pipeline.wait_for_end_of_stream(Duration::from_secs(10)));
        pipeline.stop();

        let stats = pipeline.statistics();
        assert_eq!(stats.decoded, 60);
        assert_eq!(stats.decode_errors, 0);
        assert_eq!(stats.presented + stats.dropped, stats.decoded);
        assert!(stats.presented > 0);
        assert!(stats.dropped > 0);
        assert!(display.live_framebuffers().is_empty());
        assert_eq!(display.on_plane(), None);
    }

    #[test]
    fn blocking_queue_presents_frames_in_order() {
        let display = Arc::new(DummyDisplay::nv12(Duration::from_millis(1)));
        let mut pipeline = Pipeline::start(
            &config(OverflowPolicy::Block),
            pool(),
            DummyBackend::new(),
            Arc::clone(&display),
            simple_stream(1, 9).into_iter(),
        )
        .unwrap();

        assert!(pipeline.wait_for_end_of_stream(Duration::from_secs(10)));
        pipeline.stop();

        let stats = pipeline.statistics();
        assert_eq!(stats.decoded, 10);
        assert_eq!(stats.presented + stats.dropped, 10);
    }

    #[test]
    fn stop_is_idempotent() {
        let display = Arc::new(DummyDisplay::nv12(Duration::from_millis(5)));
        let mut pipeline = Pipeline::start(
            &config(OverflowPolicy::DropOldest),
            pool(),
            DummyBackend::new(),
            Arc::clone(&display),
            simple_stream(1, 200).into_iter(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        pipeline.stop();
        let stats = pipeline.statistics();
        assert_eq!(stats.presented + stats.dropped, stats.decoded);

        pipeline.stop();
        assert_eq!(pipeline.statistics(), stats);
        assert!(display.live_framebuffers().is_empty());
        assert_eq!(display.on_plane(), None);
    }

    #[test]
    fn stop_drains_frames_being_decoded() {
        let backend = DummyBackend::new();
        let control = backend.control();
        control.set_auto_complete(false);
        let display = Arc::new(DummyDisplay::nv12(Duration::from_millis(1)));
        let mut pipeline = Pipeline::start(
            &config(OverflowPolicy::Block),
            pool(),
            backend,
            Arc::clone(&display),
            simple_stream(1, 2).into_iter(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while control.jobs().len() < 3 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!pipeline.wait_for_end_of_stream(Duration::from_millis(20)));

        // The hardware finishes while the pipeline is stopping.
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control.complete_all();
        });
        pipeline.stop();
        completer.join().unwrap();

        let stats = pipeline.statistics();
        assert_eq!(stats.decoded, 3);
        assert_eq!(stats.presented + stats.dropped, stats.decoded);
        assert!(display.live_framebuffers().is_empty());
    }

    #[test]
    fn busy_decoder_waits_for_the_display() {
        let stats = Arc::new(PipelineStatistics::new());
        let queues = Arc::new(Queues {
            decoded: BoundedQueue::new(3, OverflowPolicy::Block),
            flip: BoundedQueue::new(1, OverflowPolicy::DropOldest),
            returned: BoundedQueue::new(32, OverflowPolicy::Block),
        });
        let nals = simple_stream(1, 3);
        let mut feed = FeedThread {
            session: DecodeSession::new(
                DummyBackend::with_ready_poll_fd(),
                pool(),
                config(OverflowPolicy::Block).decoder,
                Arc::clone(&stats),
            ),
            source: Vec::<NalUnit>::new().into_iter(),
            parameter_sets: ParameterSetState::new(),
            assembler: AccessUnitAssembler::new(),
            queues: Arc::clone(&queues),
            stats,
            cancel: Arc::new(AtomicBool::new(false)),
            drain_timeout: Duration::from_secs(1),
            output_buffers: 2,
            capture_buffers: 3,
        };
        for nal in &nals[..2] {
            feed.parameter_sets.process(nal).unwrap();
        }
        let sps = Arc::clone(feed.parameter_sets.sps().unwrap());
        feed.session.initialize(2, 3, &sps).unwrap();

        // Every CAPTURE buffer ends up with the display.
        let mut frames = Vec::new();
        for nal in &nals[2..5] {
            feed.session
                .submit_frame(std::slice::from_ref(nal), &feed.parameter_sets)
                .unwrap();
            frames.extend(feed.session.reclaim().unwrap());
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(feed.session.queued_capture_buffers(), 0);
        assert!(matches!(
            feed.session
                .submit_frame(&nals[5..6], &feed.parameter_sets)
                .unwrap(),
            SubmitResult::Busy
        ));

        // The ready descriptor must not be mistaken for decoder progress.
        let start = Instant::now();
        feed.wait_for_decoder().unwrap();
        assert!(start.elapsed() >= RETURN_TIMEOUT);

        // The IDR picture is not a reference anymore.
        assert!(matches!(
            queues.returned.push(frames.remove(0)),
            PushOutcome::Queued
        ));
        feed.wait_for_decoder().unwrap();
        assert!(queues.returned.is_empty());
        assert_eq!(feed.session.queued_capture_buffers(), 1);
    }

    #[test]
    fn no_compatible_plane_fails_start() {
        let display = Arc::new(DummyDisplay::new(
            dummy_resources(&[(1920, 1080, 60)], &[fourcc(b"XR24")]),
            Duration::ZERO,
        ));

        let e = Pipeline::start(
            &config(OverflowPolicy::DropOldest),
            pool(),
            DummyBackend::new(),
            display,
            simple_stream(1, 1).into_iter(),
        )
        .err()
        .unwrap();

        let display_error = e.downcast_ref::<DisplayError>().unwrap();
        assert!(display_error.is_no_display());
    }
}
