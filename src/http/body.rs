//! Bounded bridge from an async request body to a blocking reader.
//!
//! The I/O side pushes body chunks into a fixed-capacity channel and waits
//! whenever it is full; the blocking side implements `std::io::Read` on top
//! of it. Reads must happen off the async runtime (e.g. in
//! `tokio::task::spawn_blocking`).

use std::io;

use axum::body::{Body, Bytes};
use futures_util::StreamExt;
use tokio::sync::mpsc;

/// Default number of chunks buffered between producer and consumer.
pub const DEFAULT_CAPACITY: usize = 8;

/// Blocking reader over a request body.
#[derive(Debug)]
pub struct BodyReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl BodyReader {
    /// Start pumping `body` into a channel holding at most `capacity` chunks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(body: Body, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(pump(body, tx));
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

async fn pump(body: Body, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let item = chunk.map_err(io::Error::other);
        let failed = item.is_err();
        // Waits while the channel is full; stops when the reader is gone.
        if tx.send(item).await.is_err() {
            tracing::trace!("Body reader dropped, discarding remaining body");
            return;
        }
        if failed {
            return;
        }
    }
}

impl io::Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        let chunk = self.current.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}
