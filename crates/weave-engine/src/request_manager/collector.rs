//! Response collector — buffers traversal output on its way to the caller.
//!
//! The traversal worker must never block on a slow caller, so everything it
//! emits lands in unbounded buffers here and drains into the caller-facing
//! streams as they are read. When the caller abandons the progress stream,
//! the collector posts the cancel event while continuing to drain, so a
//! traversal blocked on publishing cannot deadlock the cancel.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use super::{InProgressRequest, RequestError, RequestEvent, ResponseProgress, STREAM_CAPACITY};

pub(crate) fn collect_responses(
    in_progress: InProgressRequest,
    cancel: Option<mpsc::Sender<RequestEvent>>,
) -> (
    mpsc::Receiver<ResponseProgress>,
    mpsc::Receiver<RequestError>,
) {
    let (progress_tx, progress_rx) = mpsc::channel(STREAM_CAPACITY);
    let (error_tx, error_rx) = mpsc::channel(STREAM_CAPACITY);
    tokio::spawn(run(in_progress, progress_tx, error_tx, cancel));
    (progress_rx, error_rx)
}

async fn run(
    mut in_progress: InProgressRequest,
    progress_out: mpsc::Sender<ResponseProgress>,
    errors_out: mpsc::Sender<RequestError>,
    cancel: Option<mpsc::Sender<RequestEvent>>,
) {
    let id = in_progress.id;
    let mut progress_buffer: VecDeque<ResponseProgress> = VecDeque::new();
    let mut error_buffer: VecDeque<RequestError> = VecDeque::new();
    let mut progress_open = true;
    let mut errors_open = true;
    let mut caller_gone = false;

    while !caller_gone {
        if !progress_open && !errors_open && progress_buffer.is_empty() && error_buffer.is_empty()
        {
            // Terminal closure: dropping the outputs closes both caller
            // streams, exactly once.
            return;
        }
        tokio::select! {
            item = in_progress.progress.recv(), if progress_open => match item {
                Some(item) => progress_buffer.push_back(item),
                None => progress_open = false,
            },
            error = in_progress.errors.recv(), if errors_open => match error {
                Some(error) => error_buffer.push_back(error),
                None => errors_open = false,
            },
            permit = progress_out.reserve(), if !progress_buffer.is_empty() => match permit {
                Ok(permit) => permit.send(progress_buffer.pop_front().expect("buffer checked")),
                Err(_) => caller_gone = true,
            },
            permit = errors_out.reserve(), if !error_buffer.is_empty() => match permit {
                Ok(permit) => permit.send(error_buffer.pop_front().expect("buffer checked")),
                // Error stream abandoned on its own: discard, keep collecting.
                Err(_) => error_buffer.clear(),
            },
            _ = progress_out.closed() => caller_gone = true,
        }
    }

    // The caller walked away. Post the cancel event while draining whatever
    // the traversal is still publishing; the event loop may itself be
    // waiting on us.
    let Some(events) = cancel else { return };
    let mut cancel_pending = true;
    while cancel_pending || progress_open || errors_open {
        tokio::select! {
            sent = events.send(RequestEvent::Cancel { id }), if cancel_pending => {
                cancel_pending = false;
                if sent.is_err() {
                    return;
                }
            }
            item = in_progress.progress.recv(), if progress_open => {
                if item.is_none() {
                    progress_open = false;
                }
            }
            error = in_progress.errors.recv(), if errors_open => {
                if error.is_none() {
                    errors_open = false;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
