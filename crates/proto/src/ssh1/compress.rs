//! zlib stream compression for SSH-1 packets.
//!
//! Compression is one zlib stream per direction for the life of the session.
//! Each packet's `type || payload` is compressed with a partial flush so the
//! peer can decompress it without waiting for more data.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tern_platform::{TernError, TernResult};

/// Highest zlib level.
pub const MAX_LEVEL: u32 = 9;

const CHUNK: usize = 4096;

/// Outbound half of the compression pair.
pub struct Compressor {
    level: u32,
    stream: Compress,
}

impl Compressor {
    /// Creates a compressor at `level` (1-9).
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Config`] if the level is out of range.
    pub fn new(level: u32) -> TernResult<Self> {
        if level == 0 || level > MAX_LEVEL {
            return Err(TernError::Config(format!(
                "Compression level {} out of range (1-{})",
                level, MAX_LEVEL
            )));
        }
        Ok(Self {
            level,
            stream: Compress::new(Compression::new(level), true),
        })
    }

    /// Configured level.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compresses one packet body.
    pub fn compress(&mut self, input: &[u8]) -> TernResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() + 64);
        let base = self.stream.total_in();
        loop {
            let consumed = (self.stream.total_in() - base) as usize;
            self.stream
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| TernError::Protocol(format!("Compression failed: {}", e)))?;
            let consumed = (self.stream.total_in() - base) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(CHUNK);
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("level", &self.level)
            .field("total_in", &self.stream.total_in())
            .field("total_out", &self.stream.total_out())
            .finish()
    }
}

/// Inbound half of the compression pair.
pub struct Decompressor {
    stream: Decompress,
    max_output: usize,
}

impl Decompressor {
    /// Creates a decompressor that refuses to inflate a packet beyond
    /// `max_output` bytes.
    pub fn new(max_output: usize) -> Self {
        Self {
            stream: Decompress::new(true),
            max_output,
        }
    }

    /// Decompresses one packet body.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] on corrupt input or if the output would
    /// exceed the configured ceiling.
    pub fn decompress(&mut self, input: &[u8]) -> TernResult<Vec<u8>> {
        let mut out = Vec::with_capacity((input.len() * 2).max(CHUNK));
        let base = self.stream.total_in();
        loop {
            let consumed = (self.stream.total_in() - base) as usize;
            let status = self
                .stream
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| TernError::Protocol(format!("Decompression failed: {}", e)))?;
            if out.len() > self.max_output {
                return Err(TernError::Protocol(format!(
                    "Decompressed packet exceeds {} bytes",
                    self.max_output
                )));
            }
            let consumed = (self.stream.total_in() - base) as usize;
            let drained = consumed == input.len() && out.len() < out.capacity();
            if drained || status == Status::StreamEnd {
                return Ok(out);
            }
            out.reserve(CHUNK);
        }
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("max_output", &self.max_output)
            .field("total_in", &self.stream.total_in())
            .finish()
    }
}
