//! Asynchronous ingress loop.
//!
//! One task per session reads into a scratch buffer, accumulates bytes,
//! extracts complete frames, and dispatches them in arrival order. After
//! a dispatch pass the accumulator never holds a complete undispatched
//! frame. The loop stops re-issuing reads once a disconnect is pending.

use super::Session;
use crate::frame::{self, Extract};
use crate::protocol::DisconnectReason;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Size of the per-read scratch buffer.
const READ_CHUNK: usize = 4096;

impl Session {
    /// Drive reads until EOF, error, or disconnect.
    pub(crate) async fn read_loop(self: Arc<Self>) {
        let mut reader = match self.reader.lock().expect("reader lock poisoned").take() {
            Some(reader) => reader,
            None => return,
        };
        let mut scratch = vec![0u8; READ_CHUNK];
        let mut incoming: Vec<u8> = Vec::new();

        loop {
            // Ignore anything received while waiting to disconnect.
            if self.is_closed() || self.disconnecting() {
                return;
            }

            let n = tokio::select! {
                result = reader.read(&mut scratch) => {
                    match result {
                        // EOF: remote closed, stop silently.
                        Ok(0) => return,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(session = self.socket_id(), error = %e, "read failed");
                            self.dropped();
                            return;
                        }
                    }
                }
                _ = self.shutdown.notified() => return,
            };

            incoming.extend_from_slice(&scratch[..n]);
            self.stats.note_recv_bytes(n);

            loop {
                match frame::extract_one(&incoming) {
                    Extract::NeedMore => break,
                    Extract::BadToken => {
                        warn!(
                            session = self.socket_id(),
                            received = %hex::encode(&incoming[..4]),
                            "invalid synchronisation token"
                        );
                        self.disconnect(DisconnectReason::BadProtocol);
                        return;
                    }
                    Extract::Oversize(declared) => {
                        warn!(session = self.socket_id(), declared, "oversize frame");
                        self.disconnect(DisconnectReason::BadProtocol);
                        return;
                    }
                    Extract::Frame { payload_len } => {
                        let total = frame::HEADER_SIZE + payload_len;
                        if !frame::validate(&incoming[..total]) {
                            warn!(session = self.socket_id(), "invalid message received");
                            self.disconnect(DisconnectReason::BadProtocol);
                            return;
                        }
                        self.stats.note_recv_packet();
                        if !self.interpret_frame(&incoming[frame::HEADER_SIZE..total]) {
                            // A handler that queued a Disconnect gets its
                            // packet flushed; anything else is a hard drop.
                            if !self.disconnecting() {
                                self.dropped();
                            }
                            return;
                        }
                        incoming.drain(..total);
                    }
                }
            }
        }
    }
}
