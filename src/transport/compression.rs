use std::io::Write;

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Streaming zlib compression of everything written to the collector after a negotiation that
///  granted compression.
///
/// Every call to [FrameCompressor::compress] ends with a sync flush, so the compressed output of
///  a frame is complete and can be decoded by the collector without waiting for later frames.
pub struct FrameCompressor {
    encoder: ZlibEncoder<Vec<u8>>,
}

impl FrameCompressor {
    pub fn new() -> FrameCompressor {
        FrameCompressor {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
        }
    }

    pub fn compress(&mut self, frame: &[u8]) -> std::io::Result<Bytes> {
        self.encoder.write_all(frame)?;
        self.encoder.flush()?;
        Ok(Bytes::from(std::mem::take(self.encoder.get_mut())))
    }
}

impl Default for FrameCompressor {
    fn default() -> Self {
        FrameCompressor::new()
    }
}
