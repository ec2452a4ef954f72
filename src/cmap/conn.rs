//! The connection handle (§3 "Connection handle", §9 "Cycles between pool and handle"): an
//! owner-visible RAII guard around a pooled stream whose `Drop` performs the deferred release.

use std::ops::{Deref, DerefMut};

use tokio::sync::mpsc;

use crate::stream::ByteStream;

use super::worker::PoolMessage;

/// A stream handed out by a [`super::ConnectionPool`]. Dereferences to `dyn ByteStream` for use;
/// dropping it returns the stream to its group (or discards it, if unhealthy) without blocking —
/// the release is a message send, not an inline call (§4.5 "ReleaseSocket").
pub struct PooledStream {
    stream: Option<Box<dyn ByteStream>>,
    group: String,
    is_reused: bool,
    release: mpsc::UnboundedSender<PoolMessage>,
}

impl PooledStream {
    pub(super) fn new(
        stream: Box<dyn ByteStream>,
        group: String,
        is_reused: bool,
        release: mpsc::UnboundedSender<PoolMessage>,
    ) -> Self {
        Self {
            stream: Some(stream),
            group,
            is_reused,
            release,
        }
    }

    /// Whether this stream came from the group's idle set rather than a freshly spawned
    /// connector (§3 "Connection handle", `is_reused`).
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    /// The pool group this stream belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Deref for PooledStream {
    type Target = dyn ByteStream;

    fn deref(&self) -> &Self::Target {
        self.stream.as_deref().expect("stream taken before drop")
    }
}

impl DerefMut for PooledStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stream.as_deref_mut().expect("stream taken before drop")
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Best-effort: if the actor has already shut down there is nothing to release to.
            let _ = self.release.send(PoolMessage::Release {
                group: std::mem::take(&mut self.group),
                stream,
            });
        }
    }
}
