use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::extractor::{self, ClipboardEvent, ExtractorState};
use super::scheduler::{
    Clock, FlushScheduler, FrameHandle, FrameScheduler, ManualFrames, MonotonicClock, Sink,
};

const READ_BUF_SIZE: usize = 16 * 1024;

/// One terminal output stream: clipboard extraction feeding a flush
/// scheduler. Owns its extractor state exclusively.
pub struct TerminalStream<S, F, C> {
    state: ExtractorState,
    scheduler: FlushScheduler<S, F, C>,
    closed: bool,
}

impl<S: Sink, F: FrameScheduler, C: Clock> TerminalStream<S, F, C> {
    pub fn new(scheduler: FlushScheduler<S, F, C>) -> Self {
        Self {
            state: ExtractorState::new(),
            scheduler,
            closed: false,
        }
    }

    /// Feed raw output. Visible bytes are queued for flushing; completed
    /// clipboard requests are returned in arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ClipboardEvent> {
        if self.closed {
            return Vec::new();
        }
        let out = extractor::process(chunk, &mut self.state);
        self.scheduler.enqueue(out.visible);
        out.events
    }

    /// The source reached its end: release held-back bytes for flushing and
    /// drop any unterminated clipboard sequence.
    pub fn end_of_input(&mut self) {
        let out = extractor::finish(&mut self.state);
        self.scheduler.enqueue(out.visible);
    }

    pub fn on_frame(&mut self, handle: FrameHandle) -> usize {
        self.scheduler.on_frame(handle)
    }

    /// Tear the stream down: cancel the outstanding frame and discard
    /// everything not yet written.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.scheduler.clear();
        let _ = extractor::finish(&mut self.state);
    }

    /// Nothing queued and no frame outstanding.
    pub fn is_idle(&self) -> bool {
        self.scheduler.pending() == 0 && !self.scheduler.is_scheduled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn scheduler(&self) -> &FlushScheduler<S, F, C> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut FlushScheduler<S, F, C> {
        &mut self.scheduler
    }
}

/// Settings for [`run_relay`].
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub budget: Duration,
    pub frame_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            budget: super::scheduler::DEFAULT_BUDGET,
            frame_interval: Duration::from_millis(16),
        }
    }
}

impl<S: Sink> TerminalStream<S, ManualFrames, MonotonicClock> {
    /// A stream suitable for [`run_relay`], sliced by `config.budget`.
    pub fn for_relay(sink: S, config: &RelayConfig) -> Self {
        Self::new(FlushScheduler::with_clock(
            sink,
            ManualFrames::default(),
            MonotonicClock::default(),
            config.budget,
        ))
    }
}

/// Counters reported when a relay finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_read: u64,
    pub chunks_written: u64,
    pub clipboard_events: u64,
    pub cancelled: bool,
}

/// Relay `reader` to `sink` until the reader ends or `shutdown` fires.
///
/// Frames fire on a tokio interval. On end of input the queue is drained
/// before returning; on shutdown it is discarded.
pub async fn run_relay<R, S, C>(
    mut reader: R,
    stream: &mut TerminalStream<S, ManualFrames, C>,
    config: RelayConfig,
    events_tx: mpsc::UnboundedSender<ClipboardEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> std::io::Result<RelayStats>
where
    R: AsyncRead + Unpin,
    S: Sink,
    C: Clock,
{
    let mut stats = RelayStats::default();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut frames = tokio::time::interval(config.frame_interval);
    frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut eof = false;
    let mut shutdown_dropped = false;

    loop {
        tokio::select! {
            read = reader.read(&mut buf), if !eof => {
                let n = read?;
                if n == 0 {
                    debug!(bytes = stats.bytes_read, "relay source ended");
                    eof = true;
                    stream.end_of_input();
                    continue;
                }
                stats.bytes_read += n as u64;
                for event in stream.push(&buf[..n]) {
                    stats.clipboard_events += 1;
                    if events_tx.send(event).is_err() {
                        debug!("clipboard receiver closed");
                    }
                }
            }
            _ = frames.tick() => {
                if let Some(handle) = stream.scheduler_mut().frames_mut().take_due() {
                    stats.chunks_written += stream.on_frame(handle) as u64;
                }
                if eof && stream.is_idle() {
                    break;
                }
            }
            signal = &mut shutdown, if !shutdown_dropped => {
                if signal.is_err() {
                    // Sender gone without signalling: keep relaying.
                    shutdown_dropped = true;
                    continue;
                }
                info!(pending = stream.scheduler().pending(), "relay shut down");
                stream.close();
                stats.cancelled = true;
                break;
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::scheduler::SteppingClock;

    fn stream() -> TerminalStream<Vec<Vec<u8>>, ManualFrames, SteppingClock> {
        TerminalStream::new(FlushScheduler::with_clock(
            Vec::new(),
            ManualFrames::default(),
            SteppingClock::new(Duration::from_millis(1)),
            Duration::from_millis(100),
        ))
    }

    fn written(s: &TerminalStream<Vec<Vec<u8>>, ManualFrames, SteppingClock>) -> Vec<u8> {
        s.scheduler().sink().concat()
    }

    #[test]
    fn push_strips_sequence_and_queues_visible_bytes() {
        let mut s = stream();
        assert!(s.push(b"one\x1b]52;c;Y29w").is_empty());
        let events = s.push(b"eQ\x07two");
        assert_eq!(events, vec![ClipboardEvent { text: "copy".into() }]);
        assert_eq!(s.scheduler().pending(), 2);

        let h = s.scheduler_mut().frames_mut().take_due().unwrap();
        s.on_frame(h);
        assert_eq!(written(&s), b"onetwo");
        assert!(s.is_idle());
    }

    #[test]
    fn close_discards_queue_and_partial_sequence() {
        let mut s = stream();
        s.push(b"stale\x1b]52;c;aGk");
        s.close();
        assert!(s.is_idle());
        assert_eq!(s.scheduler().frames().cancelled(), 1);
        assert!(s.push(b"\x07more").is_empty());
        assert!(written(&s).is_empty());
    }

    #[test]
    fn end_of_input_flushes_held_prefix() {
        let mut s = stream();
        s.push(b"x\x1b]");
        s.end_of_input();
        let h = s.scheduler_mut().frames_mut().take_due().unwrap();
        s.on_frame(h);
        assert_eq!(written(&s), b"x\x1b]");
    }

    #[tokio::test]
    async fn relay_drains_reader_and_reports_events() {
        let input: &[u8] = b"hello \x1b]52;c;aGk=\x07world\n";
        let mut s = stream();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let config = RelayConfig {
            budget: Duration::from_millis(4),
            frame_interval: Duration::from_millis(1),
        };

        let stats = run_relay(input, &mut s, config, tx, stop_rx).await.unwrap();

        assert_eq!(written(&s), b"hello world\n");
        assert_eq!(stats.bytes_read, input.len() as u64);
        assert_eq!(stats.clipboard_events, 1);
        assert!(!stats.cancelled);
        assert_eq!(rx.recv().await.unwrap().text, "hi");
    }

    #[tokio::test]
    async fn relay_shutdown_cancels_outstanding_frame() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut s = stream();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();

        let stats = run_relay(reader, &mut s, RelayConfig::default(), tx, stop_rx)
            .await
            .unwrap();
        assert!(stats.cancelled);
        assert!(s.is_closed());
        assert!(written(&s).is_empty());
    }
}
