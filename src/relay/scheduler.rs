//! Time-sliced flushing of queued terminal output.
//!
//! Bursts of output are queued and drained to a [`Sink`] across frames.
//! Each frame writes items in FIFO order until the per-frame budget is
//! spent, then requests one continuation frame if anything is left. At most
//! one frame is outstanding at any time.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{trace, warn};

pub const DEFAULT_BUDGET: Duration = Duration::from_millis(4);

/// Identifies one requested frame so a late or cancelled one can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

/// Host frame primitive. When a requested frame fires, the host calls
/// [`FlushScheduler::on_frame`] with its handle.
pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameHandle;
    fn cancel_frame(&mut self, handle: FrameHandle);
}

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Render target for flushed bytes.
pub trait Sink {
    fn write(&mut self, chunk: &[u8]);
}

/// Wall-clock monotonic time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that advances by a fixed step every time it is read.
///
/// Makes every sink write "cost" `step`, which keeps slicing deterministic
/// in tests and replays.
#[derive(Debug)]
pub struct SteppingClock {
    now: Cell<Duration>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

/// Frame primitive that only records requests; the owner decides when a
/// frame fires. Used by the tokio relay loop (which fires the armed frame on
/// its interval) and by tests.
#[derive(Debug, Default)]
pub struct ManualFrames {
    next_id: u64,
    armed: Option<FrameHandle>,
    requested: usize,
    cancelled: usize,
}

impl ManualFrames {
    /// The frame currently waiting to fire, if any.
    pub fn armed(&self) -> Option<FrameHandle> {
        self.armed
    }

    /// Take the armed frame so the caller can fire it.
    pub fn take_due(&mut self) -> Option<FrameHandle> {
        self.armed.take()
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled
    }
}

impl FrameScheduler for ManualFrames {
    fn request_frame(&mut self) -> FrameHandle {
        self.next_id += 1;
        let handle = FrameHandle(self.next_id);
        self.armed = Some(handle);
        self.requested += 1;
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        if self.armed == Some(handle) {
            self.armed = None;
        }
        self.cancelled += 1;
    }
}

/// Records every write; handy for assertions and offline replays.
impl Sink for Vec<Vec<u8>> {
    fn write(&mut self, chunk: &[u8]) {
        self.push(chunk.to_vec());
    }
}

/// Forwards flushed chunks to another task. A closed receiver drops output.
impl Sink for mpsc::UnboundedSender<Vec<u8>> {
    fn write(&mut self, chunk: &[u8]) {
        if self.send(chunk.to_vec()).is_err() {
            trace!(len = chunk.len(), "render receiver closed, chunk dropped");
        }
    }
}

/// Writes flushed chunks to any `io::Write`, flushing after each one.
pub struct WriterSink<W: Write> {
    out: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn write(&mut self, chunk: &[u8]) {
        if let Err(e) = self.out.write_all(chunk).and_then(|()| self.out.flush()) {
            warn!(error = %e, len = chunk.len(), "render sink write failed");
        }
    }
}

/// Budgeted FIFO write coalescer.
pub struct FlushScheduler<S, F, C = MonotonicClock> {
    queue: VecDeque<Vec<u8>>,
    sink: S,
    frames: F,
    clock: C,
    budget: Duration,
    scheduled: Option<FrameHandle>,
}

impl<S: Sink, F: FrameScheduler> FlushScheduler<S, F, MonotonicClock> {
    pub fn new(sink: S, frames: F) -> Self {
        Self::with_clock(sink, frames, MonotonicClock::default(), DEFAULT_BUDGET)
    }
}

impl<S: Sink, F: FrameScheduler, C: Clock> FlushScheduler<S, F, C> {
    pub fn with_clock(sink: S, frames: F, clock: C, budget: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            sink,
            frames,
            clock,
            budget,
            scheduled: None,
        }
    }

    /// Queue a chunk for the next frame. Empty chunks are ignored.
    pub fn enqueue(&mut self, chunk: impl Into<Vec<u8>>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.queue.push_back(chunk);
        if self.scheduled.is_none() {
            self.scheduled = Some(self.frames.request_frame());
        }
    }

    /// Run one frame. Returns the number of chunks written.
    ///
    /// A handle that is not the outstanding frame (already fired or
    /// cancelled) is ignored.
    pub fn on_frame(&mut self, handle: FrameHandle) -> usize {
        if self.scheduled != Some(handle) {
            trace!(frame = handle.0, "stale frame ignored");
            return 0;
        }
        self.scheduled = None;

        let start = self.clock.now();
        let mut written = 0;
        while let Some(chunk) = self.queue.pop_front() {
            self.sink.write(&chunk);
            written += 1;
            if self.clock.now().saturating_sub(start) >= self.budget {
                break;
            }
        }

        if !self.queue.is_empty() {
            trace!(remaining = self.queue.len(), "frame budget spent");
            self.scheduled = Some(self.frames.request_frame());
        }
        written
    }

    /// Drop all queued output and cancel the outstanding frame. Nothing
    /// queued is written.
    pub fn clear(&mut self) {
        self.queue.clear();
        if let Some(handle) = self.scheduled.take() {
            self.frames.cancel_frame(handle);
        }
    }

    /// Number of chunks waiting to be written.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    type TestScheduler = FlushScheduler<Vec<Vec<u8>>, ManualFrames, SteppingClock>;

    /// Each clock read advances 2ms against a 4ms budget, so every frame
    /// writes exactly two chunks.
    fn scheduler() -> TestScheduler {
        FlushScheduler::with_clock(
            Vec::new(),
            ManualFrames::default(),
            SteppingClock::new(Duration::from_millis(2)),
            DEFAULT_BUDGET,
        )
    }

    fn fire(s: &mut TestScheduler) -> usize {
        let handle = s.frames_mut().take_due().unwrap();
        s.on_frame(handle)
    }

    #[test]
    fn nothing_written_before_first_frame() {
        let mut s = scheduler();
        s.enqueue(b"a".to_vec());
        s.enqueue(b"b".to_vec());
        s.enqueue(b"c".to_vec());
        assert!(s.sink().is_empty());
        assert_eq!(s.frames().requested(), 1);
        assert!(s.is_scheduled());
    }

    #[test]
    fn frames_drain_in_fifo_slices() {
        let mut s = scheduler();
        for chunk in ["a", "b", "c"] {
            s.enqueue(chunk);
        }

        assert_eq!(fire(&mut s), 2);
        assert_eq!(s.sink(), &vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(s.pending(), 1);
        assert!(s.is_scheduled());

        assert_eq!(fire(&mut s), 1);
        assert_eq!(s.sink(), &vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(!s.is_scheduled());
        assert_eq!(s.frames().requested(), 2);
    }

    #[test]
    fn enqueue_during_continuation_does_not_schedule_again() {
        let mut s = scheduler();
        for chunk in ["a", "b", "c"] {
            s.enqueue(chunk);
        }
        fire(&mut s);
        assert_eq!(s.frames().requested(), 2);

        s.enqueue("d");
        s.enqueue("e");
        assert_eq!(s.frames().requested(), 2);
        assert!(s.frames().armed().is_some());
    }

    #[test]
    fn clear_cancels_frame_and_discards_output() {
        let mut s = scheduler();
        s.enqueue("a");
        s.enqueue("b");
        let handle = s.frames().armed().unwrap();

        s.clear();
        assert_eq!(s.frames().cancelled(), 1);
        assert!(s.frames().armed().is_none());
        assert_eq!(s.pending(), 0);

        // A frame that fires late after cancellation writes nothing.
        assert_eq!(s.on_frame(handle), 0);
        assert!(s.sink().is_empty());

        // Clearing an idle scheduler cancels nothing further.
        s.clear();
        assert_eq!(s.frames().cancelled(), 1);
    }

    #[test]
    fn budget_zero_still_makes_progress() {
        let mut s = FlushScheduler::with_clock(
            Vec::new(),
            ManualFrames::default(),
            SteppingClock::new(Duration::ZERO),
            Duration::ZERO,
        );
        s.enqueue("a");
        s.enqueue("b");
        let h = s.frames_mut().take_due().unwrap();
        assert_eq!(s.on_frame(h), 1);
        let h = s.frames_mut().take_due().unwrap();
        assert_eq!(s.on_frame(h), 1);
        assert_eq!(s.sink().len(), 2);
    }

    #[test]
    fn empty_chunks_are_not_queued() {
        let mut s = scheduler();
        s.enqueue(Vec::new());
        assert_eq!(s.pending(), 0);
        assert!(!s.is_scheduled());
    }

    #[test]
    fn writer_sink_writes_raw_bytes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write(b"\xffraw");
        assert_eq!(sink.into_inner(), b"\xffraw");
    }
}
