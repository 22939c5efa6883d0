//! Serialised egress queue.
//!
//! All writes for a session funnel through one FIFO guarded by a mutex.
//! The head of the queue is the buffer currently being written; completion
//! pops it and starts the next. A write error closes the socket without
//! popping, so nothing further is transmitted. The drive task only exists
//! while the queue is non-empty and owns the write half for that span.

use super::Session;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::warn;

pub(super) struct Egress {
    state: Mutex<EgressState>,
}

struct EgressState {
    /// Pending buffers; the head is in flight while `writing` is set.
    queue: VecDeque<Vec<u8>>,
    /// Write half, parked here whenever no drive task is running.
    writer: Option<OwnedWriteHalf>,
    /// Whether a drive task currently owns the write half.
    writing: bool,
}

impl Egress {
    pub(super) fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            state: Mutex::new(EgressState {
                queue: VecDeque::new(),
                writer: Some(writer),
                writing: false,
            }),
        }
    }

    /// Drop the write half, shutting down the send direction. Called from
    /// `Session::dropped`; a running drive task notices on its next pass.
    pub(super) fn close(&self) {
        let writer = self
            .state
            .lock()
            .expect("egress lock poisoned")
            .writer
            .take();
        drop(writer);
    }

}

impl Session {
    /// Append a buffer to the egress queue, starting the drive task if the
    /// queue just became active.
    pub(crate) fn enqueue(&self, packet: Vec<u8>) {
        if self.is_closed() {
            return;
        }

        let writer = {
            let mut state = self.egress.state.lock().expect("egress lock poisoned");
            state.queue.push_back(packet);
            if state.writing {
                None
            } else {
                state.writer.take().map(|writer| {
                    state.writing = true;
                    writer
                })
            }
        };

        if let Some(writer) = writer {
            match self.weak_self.upgrade() {
                Some(session) => {
                    tokio::spawn(session.drive_writes(writer));
                }
                None => {
                    // Session is being torn down; park the writer so the
                    // socket still closes cleanly.
                    let mut state = self.egress.state.lock().expect("egress lock poisoned");
                    state.writer = Some(writer);
                    state.writing = false;
                }
            }
        }
    }

    /// Write queued buffers until the queue drains or the socket dies.
    async fn drive_writes(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        loop {
            if self.is_closed() {
                // Forced drop: discard the write half without flushing.
                self.egress.state.lock().expect("egress lock poisoned").writing = false;
                return;
            }

            let packet = {
                let mut state = self.egress.state.lock().expect("egress lock poisoned");
                match state.queue.front_mut() {
                    Some(buf) => mem::take(buf),
                    None => {
                        state.writer = Some(writer);
                        state.writing = false;
                        return;
                    }
                }
            };

            match writer.write_all(&packet).await {
                Ok(()) => {
                    self.stats.note_sent(packet.len());
                    self.egress
                        .state
                        .lock()
                        .expect("egress lock poisoned")
                        .queue
                        .pop_front();
                }
                Err(e) => {
                    warn!(session = self.socket_id(), error = %e, "write failed");
                    self.egress.state.lock().expect("egress lock poisoned").writing = false;
                    self.dropped();
                    return;
                }
            }
        }
    }
}
