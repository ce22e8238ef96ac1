//! A bounded single-producer/single-consumer byte pipe. The download
//! engine's workers write ordered chunks into one end; the caller of
//! [`crate::download_stream`] reads the other end as an ordinary [`Read`].
//! Capacity bounds how far the fastest worker can run ahead of a slow
//! consumer without buffering the whole object in memory.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Create a pipe with room for `capacity` in-flight chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        },
    )
}

#[derive(Clone)]
pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
}

impl PipeWriter {
    /// Blocks until the reader has room for another chunk. Once the reader
    /// side has been dropped this returns a broken-pipe error; callers treat
    /// that as fatal rather than retryable, since there is nothing left to
    /// deliver bytes to.
    pub fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                // All writers dropped (or the engine closed its end): EOF.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn round_trips_bytes_in_order() {
        let (w, mut r) = pipe(4);
        let handle = thread::spawn(move || {
            for chunk in [&b"hello "[..], &b"world"[..]] {
                w.write_chunk(chunk).unwrap();
            }
        });
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn dropping_reader_is_fatal_to_writer() {
        let (w, r) = pipe(1);
        drop(r);
        assert!(w.write_chunk(b"x").is_err());
    }
}
