//! A resettable, seekable-by-restart reader wrapping a [`SourceAdapter`] for
//! one download worker. Hides whether the underlying transport is a fresh
//! range request per chunk or one persistent multipart response covering the
//! worker's whole stripe.

use std::io::{self, Read};
use std::sync::Arc;

use tracing::debug;

use crate::adapter::{RangeSpec, SourceAdapter};
use crate::config::Config;
use crate::error::EngineError;
use crate::retry::with_retry;

pub struct ChunkReader {
    adapter: Arc<dyn SourceAdapter>,
    size: u64,
    chunk_size: u64,
    num_workers: u64,
    worker_index: u64,
    use_multipart: bool,
    pub cur_chunk_start: u64,
    stream: Option<Box<dyn Read + Send>>,
}

impl ChunkReader {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        size: u64,
        worker_index: u64,
        chunk_size: u64,
        num_workers: u64,
        use_multipart: bool,
    ) -> Self {
        Self {
            adapter,
            size,
            chunk_size,
            num_workers,
            worker_index,
            use_multipart,
            cur_chunk_start: worker_index * chunk_size,
            stream: None,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.size
    }

    /// The byte range covered by the chunk starting at `start`.
    fn chunk_range(&self, start: u64) -> RangeSpec {
        RangeSpec::new(start, (start + self.chunk_size).min(self.size))
    }

    /// The remaining ranges in this worker's stripe, starting at `from`.
    fn stripe_ranges(&self, from: u64) -> Vec<RangeSpec> {
        let mut ranges = Vec::new();
        let mut chunk_start = self.cur_chunk_start;
        let mut first = true;
        while chunk_start < self.size {
            let range = if first {
                RangeSpec::new(from, (chunk_start + self.chunk_size).min(self.size))
            } else {
                self.chunk_range(chunk_start)
            };
            if !range.is_empty() {
                ranges.push(range);
            }
            first = false;
            chunk_start += self.num_workers * self.chunk_size;
        }
        ranges
    }

    /// Ensure a byte stream exists positioned at the start of the current
    /// chunk. In multipart mode this issues one request for the whole
    /// remaining stripe and is a no-op on subsequent chunks within it.
    pub fn request_chunk(&mut self, cfg: &Config) -> Result<(), EngineError> {
        if self.stream.is_some() {
            return Ok(());
        }

        if self.use_multipart {
            let ranges = self.stripe_ranges(self.cur_chunk_start);
            debug!(worker = self.worker_index, n_ranges = ranges.len(), "requesting stripe multipart");
            let stream = with_retry(cfg, "get_multipart", || self.adapter.get_multipart(&ranges))?;
            self.stream = Some(stream);
        } else {
            let range = self.chunk_range(self.cur_chunk_start);
            debug!(worker = self.worker_index, ?range, "requesting chunk range");
            let stream = with_retry(cfg, "get_range", || self.adapter.get_range(range))?;
            self.stream = Some(stream);
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(s) => s.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no active stream")),
        }
    }

    /// Abort the current stream and re-request starting at `from_offset`.
    pub fn reset(&mut self, from_offset: u64, cfg: &Config) -> Result<(), EngineError> {
        self.stream = None;
        if self.use_multipart {
            let ranges = self.stripe_ranges(from_offset);
            let stream = with_retry(cfg, "get_multipart (reset)", || self.adapter.get_multipart(&ranges))?;
            self.stream = Some(stream);
        } else {
            let range = RangeSpec::new(from_offset, (self.cur_chunk_start + self.chunk_size).min(self.size));
            let stream = with_retry(cfg, "get_range (reset)", || self.adapter.get_range(range))?;
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// Move `cur_chunk_start` forward by `num_workers * chunk_size`. In
    /// single-range mode this drops the stream so the next chunk issues a
    /// fresh request; in multipart mode the stream is left in place since it
    /// already covers the rest of the stripe.
    pub fn advance_next_chunk(&mut self) {
        self.cur_chunk_start += self.num_workers * self.chunk_size;
        if !self.use_multipart {
            self.stream = None;
        }
    }

}

/// True iff a chunk starting at `start` is complete given `progress` bytes
/// delivered so far, either because it reached the configured chunk size or
/// because it reached the end of the object.
pub fn chunk_finished(start: u64, progress: u64, size: u64, chunk_size: u64) -> bool {
    progress == chunk_size || start + progress >= size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ObjectMeta, SourceAdapter};
    use crate::error::AdapterError;
    use proptest::prelude::*;
    use std::io::Cursor;

    struct InMemoryAdapter {
        data: Vec<u8>,
    }

    impl SourceAdapter for InMemoryAdapter {
        fn probe(&self, _chunk_size: u64) -> Result<ObjectMeta, AdapterError> {
            Ok(ObjectMeta {
                size: self.data.len() as u64,
                supports_range: true,
                supports_multipart: true,
            })
        }

        fn get_all(&self) -> Result<Box<dyn Read + Send>, AdapterError> {
            Ok(Box::new(Cursor::new(self.data.clone())))
        }

        fn get_range(&self, range: RangeSpec) -> Result<Box<dyn Read + Send>, AdapterError> {
            let slice = self.data[range.start as usize..range.end as usize].to_vec();
            Ok(Box::new(Cursor::new(slice)))
        }

        fn get_multipart(&self, ranges: &[RangeSpec]) -> Result<Box<dyn Read + Send>, AdapterError> {
            let mut out = Vec::new();
            for r in ranges {
                out.extend_from_slice(&self.data[r.start as usize..r.end as usize]);
            }
            Ok(Box::new(Cursor::new(out)))
        }
    }

    #[test]
    fn single_range_mode_issues_one_request_per_chunk() {
        let data: Vec<u8> = (0..30u8).collect();
        let adapter: Arc<dyn SourceAdapter> = Arc::new(InMemoryAdapter { data: data.clone() });
        let mut reader = ChunkReader::new(adapter, data.len() as u64, 0, 10, 3, false);

        reader.request_chunk(&Config::default()).unwrap();
        let mut buf = [0u8; 10];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, &data[0..10]);

        reader.advance_next_chunk();
        assert_eq!(reader.cur_chunk_start, 30);
    }

    #[test]
    fn multipart_mode_reads_contiguously_across_chunks() {
        let data: Vec<u8> = (0..30u8).collect();
        let adapter: Arc<dyn SourceAdapter> = Arc::new(InMemoryAdapter { data: data.clone() });
        // Worker 0 of 3 owns chunks [0,10) and [30,...) is out of range for a
        // 30-byte object, so its stripe is just the first chunk here.
        let mut reader = ChunkReader::new(adapter, data.len() as u64, 0, 10, 3, true);

        reader.request_chunk(&Config::default()).unwrap();
        let mut buf = [0u8; 10];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &data[0..10]);
    }

    #[test]
    fn chunk_finished_detects_both_size_cap_and_object_end() {
        assert!(chunk_finished(0, 10, 100, 10));
        assert!(chunk_finished(95, 5, 100, 10));
        assert!(!chunk_finished(0, 5, 100, 10));
    }

    /// Drains one worker's whole stripe into `(chunk_index, bytes)` pairs by
    /// driving the same request/read/advance loop `engine::reader_activity`
    /// uses, without the threads or the pipe.
    fn drain_stripe(mut reader: ChunkReader, size: u64, chunk_size: u64) -> Vec<(u64, Vec<u8>)> {
        let cfg = Config::default();
        let mut out = Vec::new();
        while reader.cur_chunk_start < size {
            let chunk_start = reader.cur_chunk_start;
            let chunk_index = chunk_start / chunk_size;
            reader.request_chunk(&cfg).unwrap();
            let mut chunk = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                chunk.extend_from_slice(&buf[..n]);
                if chunk_finished(chunk_start, chunk.len() as u64, size, chunk_size) {
                    break;
                }
            }
            out.push((chunk_index, chunk));
            reader.advance_next_chunk();
        }
        out
    }

    /// Reassembles an object from every worker's stripe and checks the
    /// result is byte-exact, for both single-range and multipart transport
    /// modes, across the object sizes, chunk sizes and worker counts named
    /// as mandatory testable properties: `S` in `[0,64)`, `C` in `[1,32)`
    /// (`C=0` is the engine's job to reject before a `ChunkReader` ever sees
    /// it, covered separately in `engine.rs`'s tests), `N` in `[1,32)`.
    fn reassemble(size: u64, chunk_size: u64, num_workers: u64, multipart: bool) -> Vec<u8> {
        let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let adapter: Arc<dyn SourceAdapter> = Arc::new(InMemoryAdapter { data: data.clone() });

        let mut chunks: Vec<(u64, Vec<u8>)> = Vec::new();
        for worker in 0..num_workers {
            let reader = ChunkReader::new(adapter.clone(), size, worker, chunk_size, num_workers, multipart);
            chunks.extend(drain_stripe(reader, size, chunk_size));
        }
        chunks.sort_by_key(|(idx, _)| *idx);
        chunks.into_iter().flat_map(|(_, bytes)| bytes).collect()
    }

    proptest! {
        #[test]
        fn byte_exact_reassembly_single_range(size in 0u64..64, chunk_size in 1u64..32, num_workers in 1u64..32) {
            let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let out = reassemble(size, chunk_size, num_workers, false);
            prop_assert_eq!(out, data);
        }

        #[test]
        fn byte_exact_reassembly_multipart(size in 0u64..64, chunk_size in 1u64..32, num_workers in 1u64..32) {
            let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let out = reassemble(size, chunk_size, num_workers, true);
            prop_assert_eq!(out, data);
        }
    }
}
