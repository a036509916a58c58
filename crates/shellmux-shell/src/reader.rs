//! Per-source read loop that pumps transport output to the session task.
//!
//! Each output stream of a connected transport gets its own OS thread, since
//! local pipe reads block. The thread never touches the session's buffer: it
//! hands raw chunks to the session's owning task over a bounded channel and
//! that task does the decoding.
//!
//! The loop stops when the shared `connected` flag drops, the stream closes,
//! or a read fails. There is no cancellation token: a loop sleeping in its
//! idle backoff notices the flag on its next iteration, so teardown takes at
//! most one backoff interval (100 ms local, 50 ms remote). A read that blocks
//! inside the transport only unwinds once the transport itself is closed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::transport::{OutputSource, ReadStatus};

/// Why a read loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderExit {
    /// The connected flag was cleared.
    Stopped,
    /// The stream reached end of file.
    Closed,
    /// A read returned an error.
    Failed(String),
    /// The session task is gone.
    ReceiverGone,
}

/// Messages from a read loop to its session task.
#[derive(Debug)]
pub enum ReaderEvent {
    Output {
        generation: u64,
        bytes: Vec<u8>,
    },
    Exited {
        generation: u64,
        source: String,
        exit: ReaderExit,
    },
}

/// Start the read loop for one output source on a dedicated OS thread.
///
/// `generation` tags every event so the session can drop output from a
/// connection it has already torn down.
pub fn spawn_reader<E>(
    name: &str,
    generation: u64,
    source: Box<dyn OutputSource>,
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<E>,
) -> io::Result<JoinHandle<ReaderExit>>
where
    E: From<ReaderEvent> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{name}-{}", source.label()))
        .spawn(move || read_loop(generation, source, connected, tx))
}

fn read_loop<E>(
    generation: u64,
    mut source: Box<dyn OutputSource>,
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<E>,
) -> ReaderExit
where
    E: From<ReaderEvent>,
{
    let mut buf = vec![0u8; source.buffer_size()];

    let exit = loop {
        if !connected.load(Ordering::Acquire) {
            break ReaderExit::Stopped;
        }

        match source.poll_read(&mut buf) {
            Ok(ReadStatus::Data(n)) => {
                let event = ReaderEvent::Output {
                    generation,
                    bytes: buf[..n].to_vec(),
                };
                if tx.blocking_send(event.into()).is_err() {
                    break ReaderExit::ReceiverGone;
                }
            }
            Ok(ReadStatus::Idle) => thread::sleep(source.idle_backoff()),
            Ok(ReadStatus::Closed) => break ReaderExit::Closed,
            // I/O errors end the loop quietly; the session sees the exit.
            Err(e) => break ReaderExit::Failed(e.to_string()),
        }
    };

    log::debug!("reader {} exited: {exit:?}", source.label());
    let _ = tx.blocking_send(
        ReaderEvent::Exited {
            generation,
            source: source.label().to_string(),
            exit: exit.clone(),
        }
        .into(),
    );
    exit
}
