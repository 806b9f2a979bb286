//! zlib stream compression codec.
//!
//! When the server acknowledges `<compress/>` with `<compressed/>`, every
//! byte after the acknowledgement - in both directions - runs through a
//! zlib stream. The codec is split into two independent halves because
//! the reader and writer tasks own their direction exclusively: the
//! writer holds the deflate half, the reader the inflate half.
//!
//! Each outgoing chunk is flushed with a zlib sync flush so the peer can
//! decode a stanza without waiting for more traffic.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Result, StreamEngineError};

/// Method name negotiated in stream features
pub const ZLIB: &str = "zlib";

/// Outbound half: stateful deflate across calls
pub struct DeflateHalf {
    compress: Compress,
}

impl DeflateHalf {
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::default(), true),
        }
    }

    /// Compress one chunk and flush it so it is decodable on its own
    pub fn compress_chunk(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start_in = self.compress.total_in();
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = (self.compress.total_in() - start_in) as usize;
            let status = self
                .compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| StreamEngineError::IoFailure(format!("deflate: {e}")))?;
            let consumed = (self.compress.total_in() - start_in) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // A sync flush is complete once all input is consumed
                    // and zlib stopped short of the output capacity.
                    if consumed == input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for DeflateHalf {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound half: stateful inflate across calls
pub struct InflateHalf {
    decompress: Decompress,
}

impl InflateHalf {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
        }
    }

    /// Decompress whatever part of the zlib stream arrived in this chunk
    pub fn decompress_chunk(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        let start_in = self.decompress.total_in();
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = (self.decompress.total_in() - start_in) as usize;
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| StreamEngineError::IoFailure(format!("inflate: {e}")))?;
            let consumed = (self.decompress.total_in() - start_in) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for InflateHalf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_across_multiple_chunks() {
        let mut deflate = DeflateHalf::new();
        let mut inflate = InflateHalf::new();

        let first = b"<stream:stream to='example.test' version='1.0'>";
        let second = "<message><body>compressed hello ".repeat(50) + "</body></message>";

        let wire1 = deflate.compress_chunk(first).unwrap();
        let plain1 = inflate.decompress_chunk(&wire1).unwrap();
        assert_eq!(plain1, first);

        let wire2 = deflate.compress_chunk(second.as_bytes()).unwrap();
        assert!(wire2.len() < second.len());
        let plain2 = inflate.decompress_chunk(&wire2).unwrap();
        assert_eq!(plain2, second.as_bytes());
    }

    #[test]
    fn sync_flush_makes_each_chunk_decodable_alone() {
        let mut deflate = DeflateHalf::new();
        let mut inflate = InflateHalf::new();

        // No trailing data needed: every chunk must decode immediately
        for i in 0..10 {
            let text = format!("<presence id='p{i}'/>");
            let wire = deflate.compress_chunk(text.as_bytes()).unwrap();
            let plain = inflate.decompress_chunk(&wire).unwrap();
            assert_eq!(plain, text.as_bytes());
        }
    }

    #[test]
    fn fragmented_compressed_input_reassembles() {
        let mut deflate = DeflateHalf::new();
        let mut inflate = InflateHalf::new();

        let text = b"<iq type='result' id='42'><bind><jid>u@e/r</jid></bind></iq>";
        let wire = deflate.compress_chunk(text).unwrap();

        let (a, b) = wire.split_at(wire.len() / 2);
        let mut plain = inflate.decompress_chunk(a).unwrap();
        plain.extend(inflate.decompress_chunk(b).unwrap());
        assert_eq!(plain, text);
    }
}
