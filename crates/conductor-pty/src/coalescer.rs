use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Instant;

use conductor_protocol::backend::ProcessSignal;
use tokio::sync::mpsc::UnboundedSender;

use crate::policy::PtyOutputPolicy;

#[derive(Debug)]
pub(crate) enum RawSignal {
    Bytes(Vec<u8>),
    Exited(Option<i32>),
}

/// Merges PTY reads into larger chunks and ends the stream with exactly one
/// `Exited` signal once the reader and the child waiter are done, or once the
/// drain period after exit has elapsed.
pub(crate) fn run_output_coalescer(
    raw_rx: Receiver<RawSignal>,
    output_tx: UnboundedSender<ProcessSignal>,
    policy: PtyOutputPolicy,
) {
    let policy = policy.normalized();
    let mut pending = Vec::new();
    let mut exit_code = None;
    let mut window_deadline: Option<Instant> = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let wake_at = match (window_deadline, drain_deadline) {
            (Some(window), Some(drain)) => Some(window.min(drain)),
            (window, drain) => window.or(drain),
        };
        let received = match wake_at {
            Some(deadline) => {
                raw_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => raw_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(RawSignal::Bytes(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                pending.extend_from_slice(&chunk);
                let Some(window) = policy.output_coalesce_window() else {
                    flush(&mut pending, &output_tx);
                    continue;
                };
                if pending.len() >= policy.output_coalesce_max_bytes {
                    flush(&mut pending, &output_tx);
                    window_deadline = None;
                } else if window_deadline.is_none() {
                    window_deadline = Instant::now().checked_add(window);
                    if window_deadline.is_none() {
                        flush(&mut pending, &output_tx);
                    }
                }
            }
            Ok(RawSignal::Exited(code)) => {
                exit_code = code;
                let now = Instant::now();
                drain_deadline = Some(now.checked_add(policy.exit_drain()).unwrap_or(now));
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                if window_deadline.is_some_and(|deadline| now >= deadline) {
                    flush(&mut pending, &output_tx);
                    window_deadline = None;
                }
                if drain_deadline.is_some_and(|deadline| now >= deadline) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    flush(&mut pending, &output_tx);
    let _ = output_tx.send(ProcessSignal::Exited { exit_code });
}

fn flush(pending: &mut Vec<u8>, output_tx: &UnboundedSender<ProcessSignal>) {
    if !pending.is_empty() {
        let _ = output_tx.send(ProcessSignal::Output(std::mem::take(pending)));
    }
}
