use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::message::{Method, OutgoingBody, OutgoingResponse, ProgressSink};

/// Result of a block-size probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    /// Number of bytes available at the probed offset, at most the requested
    /// size
    pub size: usize,
    /// Whether additional bytes exist beyond this block
    pub more: bool,
    /// Whether the probed offset was valid
    pub request_in_range: bool,
}

impl BlockSize {
    const OUT_OF_RANGE: Self = Self {
        size: 0,
        more: false,
        request_in_range: false,
    };
}

/// Errors produced by [`BlockSource::read`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockSourceError {
    /// The requested range is not available
    ///
    /// Also covers I/O failures on file-backed sources, which degrade to
    /// out-of-range rather than propagating: the engine cannot recover from
    /// an I/O failure mid-transfer.
    #[error("requested block out of range (offset {offset}, size {size})")]
    OutOfRange {
        /// The offset that was requested
        offset: i64,
        /// The size that was requested
        size: i64,
    },
}

/// A GET or DELETE request was built with a non-empty body
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{method} requests cannot carry a body")]
pub struct BodyNotAllowed {
    /// The offending method
    pub method: Method,
}

/// A payload backing store the engine pulls outgoing blocks from
///
/// Offsets and sizes are signed because they arrive from the engine as signed
/// integers; negative values are out of range, never a panic.
pub trait BlockSource: Send {
    /// How much data is available from `offset`, up to `size` bytes
    ///
    /// Returns `{0, false, false}` when `offset` or `size` is negative or
    /// `offset` is at or past the end of available data.
    fn probe(&mut self, offset: i64, size: i64) -> BlockSize;

    /// Return exactly `size` bytes starting at `offset`
    ///
    /// Reports `offset` to the progress sink on success. Stream-backed
    /// sources are forward-only: each read advances the cursor, and callers
    /// must request monotonically increasing, non-overlapping offsets.
    fn read(&mut self, offset: i64, size: i64) -> Result<Bytes, BlockSourceError>;
}

/// Block source over an in-memory payload
struct MemorySource {
    data: Bytes,
    progress: Arc<dyn ProgressSink>,
}

impl BlockSource for MemorySource {
    fn probe(&mut self, offset: i64, size: i64) -> BlockSize {
        bounded_probe(self.data.len() as i64, offset, size)
    }

    fn read(&mut self, offset: i64, size: i64) -> Result<Bytes, BlockSourceError> {
        let len = self.data.len() as i64;
        let Some(end) = offset.checked_add(size) else {
            return Err(BlockSourceError::OutOfRange { offset, size });
        };
        if offset < 0 || size < 0 || offset >= len || end > len {
            return Err(BlockSourceError::OutOfRange { offset, size });
        }
        self.progress.on_progress(offset as u64);
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

/// Block source over a forward-only reader
///
/// Probes buffer ahead of the cursor so they can report whether more data
/// exists; what counts as "available" may grow between probes as the
/// underlying stream produces data.
struct ReaderSource {
    reader: Box<dyn Read + Send>,
    /// Bytes pulled from the reader but not yet consumed by `read`
    buffered: Vec<u8>,
    /// Total bytes handed out so far
    consumed: u64,
    eof: bool,
    progress: Arc<dyn ProgressSink>,
}

impl ReaderSource {
    fn new(reader: Box<dyn Read + Send>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            reader,
            buffered: Vec::new(),
            consumed: 0,
            eof: false,
            progress,
        }
    }

    /// Pull from the reader until `target` bytes are buffered or the stream
    /// ends. I/O errors are treated as end of stream.
    fn fill(&mut self, target: usize) {
        let mut chunk = [0u8; 4096];
        while !self.eof && self.buffered.len() < target {
            let want = (target - self.buffered.len()).min(chunk.len());
            match self.reader.read(&mut chunk[..want]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffered.extend_from_slice(&chunk[..n]),
                Err(error) => {
                    debug!(%error, "stream read failed, treating as end of data");
                    self.eof = true;
                }
            }
        }
    }
}

impl BlockSource for ReaderSource {
    fn probe(&mut self, offset: i64, size: i64) -> BlockSize {
        if offset < 0 || size < 0 {
            return BlockSize::OUT_OF_RANGE;
        }
        let rel = (offset as u64).saturating_sub(self.consumed);
        // buffer one byte past the requested block to learn whether more
        // data follows
        self.fill(rel.saturating_add(size as u64).saturating_add(1) as usize);
        let available = self.consumed + self.buffered.len() as u64;
        bounded_probe(available as i64, offset, size)
    }

    fn read(&mut self, offset: i64, size: i64) -> Result<Bytes, BlockSourceError> {
        if offset < 0 || size < 0 {
            return Err(BlockSourceError::OutOfRange { offset, size });
        }
        self.fill(size as usize);
        if self.buffered.len() < size as usize {
            return Err(BlockSourceError::OutOfRange { offset, size });
        }
        let rest = self.buffered.split_off(size as usize);
        let block = std::mem::replace(&mut self.buffered, rest);
        self.consumed += size as u64;
        self.progress.on_progress(offset as u64);
        Ok(Bytes::from(block))
    }
}

/// Block source over a file, opened and positioned per call
///
/// I/O failures degrade to out-of-range results instead of propagating.
struct FileSource {
    path: PathBuf,
    progress: Arc<dyn ProgressSink>,
}

impl BlockSource for FileSource {
    fn probe(&mut self, offset: i64, size: i64) -> BlockSize {
        let len = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len() as i64,
            Err(error) => {
                debug!(%error, path = %self.path.display(), "failed to stat payload file");
                return BlockSize::OUT_OF_RANGE;
            }
        };
        bounded_probe(len, offset, size)
    }

    fn read(&mut self, offset: i64, size: i64) -> Result<Bytes, BlockSourceError> {
        if offset < 0 || size < 0 {
            return Err(BlockSourceError::OutOfRange { offset, size });
        }
        let out_of_range = BlockSourceError::OutOfRange { offset, size };
        let mut file = File::open(&self.path).map_err(|error| {
            debug!(%error, path = %self.path.display(), "failed to open payload file");
            out_of_range.clone()
        })?;
        let len = file
            .metadata()
            .map_err(|_| out_of_range.clone())?
            .len() as i64;
        let Some(end) = offset.checked_add(size) else {
            return Err(out_of_range);
        };
        if offset >= len || end > len {
            return Err(out_of_range);
        }
        let mut block = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.read_exact(&mut block))
            .map_err(|error| {
                debug!(%error, path = %self.path.display(), "failed to read payload block");
                out_of_range.clone()
            })?;
        self.progress.on_progress(offset as u64);
        Ok(Bytes::from(block))
    }
}

/// Shared probe arithmetic for sources with a known length
fn bounded_probe(available: i64, offset: i64, size: i64) -> BlockSize {
    if offset < 0 || size < 0 || offset >= available {
        return BlockSize::OUT_OF_RANGE;
    }
    let size = size.min(available - offset);
    BlockSize {
        size: size as usize,
        more: offset + size < available,
        request_in_range: true,
    }
}

fn source_for_body(body: OutgoingBody, progress: Arc<dyn ProgressSink>) -> Box<dyn BlockSource> {
    match body {
        OutgoingBody::Empty => Box::new(MemorySource {
            data: Bytes::new(),
            progress,
        }),
        OutgoingBody::Bytes(data) => Box::new(MemorySource { data, progress }),
        OutgoingBody::Reader(reader) => Box::new(ReaderSource::new(reader, progress)),
        OutgoingBody::File(path) => Box::new(FileSource { path, progress }),
    }
}

/// Select the block source for an outgoing request body
///
/// GET and DELETE requests yield no source (there is nothing to send) and
/// fail if their body is non-empty. POST and PUT always yield a source, even
/// for an empty body.
pub fn request_source(
    method: Method,
    body: OutgoingBody,
    progress: Arc<dyn ProgressSink>,
) -> Result<Option<Box<dyn BlockSource>>, BodyNotAllowed> {
    if method.allows_body() {
        return Ok(Some(source_for_body(body, progress)));
    }
    match body {
        OutgoingBody::Empty => Ok(None),
        _ => Err(BodyNotAllowed { method }),
    }
}

/// Select the block source for an outgoing response body
pub fn response_source(
    response: OutgoingResponse,
    progress: Arc<dyn ProgressSink>,
) -> Box<dyn BlockSource> {
    source_for_body(response.body, progress)
}
