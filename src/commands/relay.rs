use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, trace};

use crate::config::Config;
use crate::relay::extractor::ClipboardEvent;
use crate::relay::scheduler::{Sink, WriterSink};
use crate::relay::stream::{RelayStats, TerminalStream, run_relay};

/// Relay a byte stream (a file, or stdin) to stdout with clipboard
/// sequences removed. Clipboard writes are logged by size; payloads only
/// at trace level. Ctrl-C stops the relay
/// and drops whatever output is still queued.
pub async fn relay(file: Option<&Path>, config: &Config) -> Result<RelayStats> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match file {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    relay_to(reader, WriterSink::new(std::io::stdout()), config, shutdown_rx).await
}

/// Relay `reader` into `sink`. Split out of [`relay`] so the plumbing can
/// be driven without a terminal.
pub async fn relay_to<R, S>(
    reader: R,
    sink: S,
    config: &Config,
    shutdown: oneshot::Receiver<()>,
) -> Result<RelayStats>
where
    R: AsyncRead + Unpin,
    S: Sink,
{
    let relay_config = config.relay_config();
    let mut stream = TerminalStream::for_relay(sink, &relay_config);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ClipboardEvent>();
    let reporter = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            report_clipboard(&event);
        }
    });

    let stats = run_relay(reader, &mut stream, relay_config, events_tx, shutdown)
        .await
        .context("relaying stream")?;
    let _ = reporter.await;
    info!(
        bytes = stats.bytes_read,
        chunks = stats.chunks_written,
        clipboard = stats.clipboard_events,
        cancelled = stats.cancelled,
        "relay finished"
    );
    Ok(stats)
}

fn report_clipboard(event: &ClipboardEvent) {
    info!(len = event.text.len(), "clipboard write requested");
    trace!(text = %event.text, "clipboard payload");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_file_contents_without_clipboard_sequences() {
        let input: &[u8] = b"before\x1b]52;c;aGk=\x07after";
        let (_keep, shutdown) = oneshot::channel();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stats = relay_to(input, tx, &Config::default(), shutdown)
            .await
            .unwrap();

        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        assert_eq!(out, b"beforeafter");
        assert_eq!(stats.clipboard_events, 1);
        assert!(!stats.cancelled);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn clipboard_payload_stays_out_of_info_logs() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            report_clipboard(&ClipboardEvent {
                text: "hunter2".into(),
            });
        });

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("clipboard write requested"));
        assert!(logged.contains("len=7"));
        assert!(!logged.contains("hunter2"));
    }
}
