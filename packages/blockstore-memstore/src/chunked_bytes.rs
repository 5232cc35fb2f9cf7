//! Chunked byte buffers: the growable sink used while unrolling a
//! serialized block, and the immutable, cheaply-cloneable result handed
//! back by `get_bytes` and to the eviction handler.

use std::io;
use std::sync::Arc;

/// Immutable, cheaply-cloneable sequence of byte chunks.
///
/// This is the resident form of a serialized block: every chunk is an
/// `Arc<[u8]>`, so cloning a [`ChunkedBytes`] (e.g. to hand a reference to
/// an eviction handler, or to return it from `get_bytes`) never copies the
/// underlying bytes.
#[derive(Debug, Clone)]
pub struct ChunkedBytes {
    chunks: Arc<Vec<Arc<[u8]>>>,
    len: u64,
}

impl ChunkedBytes {
    /// Total length in bytes across all chunks.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The individual chunks, in write order.
    #[must_use]
    pub fn chunks(&self) -> &[Arc<[u8]>] {
        &self.chunks
    }

    /// Concatenates all chunks into a single owned buffer. For tests and
    /// small blocks; large resident blocks should iterate [`Self::chunks`]
    /// instead.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for chunk in self.chunks.iter() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Growable byte sink used while unrolling the bytes variant of a block.
///
/// Buffers writes into fixed-size chunks so a single huge contiguous
/// allocation is never required, regardless of final block size.
/// Implements [`io::Write`] so a [`crate::traits::SerializerManager`] can
/// wrap it (e.g. with a compressing writer) before the unroll engine writes
/// encoded records through it.
pub struct ChunkedByteSink {
    chunk_size: usize,
    completed: Vec<Arc<[u8]>>,
    current: Vec<u8>,
    len: u64,
}

impl ChunkedByteSink {
    /// Creates an empty sink that flushes completed chunks at `chunk_size`
    /// bytes.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            completed: Vec::new(),
            current: Vec::with_capacity(chunk_size),
            len: 0,
        }
    }

    /// Exact number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether anything has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes the partial chunk (if any) and freezes the sink into an
    /// immutable [`ChunkedBytes`].
    #[must_use]
    pub fn finish(mut self) -> ChunkedBytes {
        if !self.current.is_empty() {
            self.completed.push(Arc::from(self.current.as_slice()));
            self.current.clear();
        }
        ChunkedBytes {
            chunks: Arc::new(self.completed),
            len: self.len,
        }
    }
}

impl io::Write for ChunkedByteSink {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let written = buf.len();
        self.len += written as u64;
        while !buf.is_empty() {
            let space = self.chunk_size - self.current.len();
            let take = space.min(buf.len());
            self.current.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.current.len() == self.chunk_size {
                self.completed.push(Arc::from(self.current.as_slice()));
                self.current.clear();
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
