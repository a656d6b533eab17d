//! Per-connection I/O tasks
//!
//! Each accepted stream gets one reader and one writer task. They own the
//! socket halves and the framing state; everything they learn re-enters the
//! core task as a [`LinkEvent`], so core state is only ever touched on the
//! processing context.

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vsm_proto::{FrameDecoder, VsmMessage};

use crate::connection::CloseReason;
use crate::detector::IoLink;
use crate::processor::WRITE_TIMEOUT;

const READ_CHUNK: usize = 8 * 1024;

/// Completion-context traffic into the core task.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Frame { stream_id: u32, message: VsmMessage },
    Closed { stream_id: u32, reason: CloseReason },
}

/// Spawn the reader/writer pair for one accepted stream.
///
/// Returns the writer queue; frames pushed into it are written with
/// [`WRITE_TIMEOUT`] applied per frame. Both tasks report failure through
/// `events` and then end; the core aborts them on teardown.
pub(crate) fn spawn_link_io(
    stream_id: u32,
    stream: Box<dyn IoLink>,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>, JoinHandle<()>) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let read_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let reason = loop {
            let want = decoder.next_read_size().min(buf.len());
            match read_half.read(&mut buf[..want]).await {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            let message = match VsmMessage::decode(frame.as_slice()) {
                                Ok(message) => message,
                                Err(err) => {
                                    let _ = read_events.send(LinkEvent::Closed {
                                        stream_id,
                                        reason: CloseReason::Parse(err.to_string()),
                                    });
                                    return;
                                }
                            };
                            if read_events
                                .send(LinkEvent::Frame { stream_id, message })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(err) => break CloseReason::Frame(err),
                },
                Err(err) => break CloseReason::ReadError(err.to_string()),
            }
        };
        let _ = read_events.send(LinkEvent::Closed { stream_id, reason });
    });

    let writer = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            let outcome = tokio::time::timeout(WRITE_TIMEOUT, write_half.write_all(&bytes)).await;
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => CloseReason::WriteError(err.to_string()),
                Err(_) => CloseReason::WriteTimeout,
            };
            let _ = events.send(LinkEvent::Closed { stream_id, reason });
            return;
        }
    });

    (writer_tx, reader, writer)
}
