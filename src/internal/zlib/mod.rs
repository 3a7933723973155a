//! Zlib helpers for the pack codec: a streaming inflate that reports exactly
//! how many compressed input bytes were consumed, and the matching deflate
//! used when emitting packs.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::errors::GitError;

/// Inflate one zlib stream that starts at the beginning of `input`.
///
/// Returns the decompressed bytes together with the number of input bytes the
/// stream occupied, so the pack cursor can advance past exactly the consumed
/// region. `size_hint` pre-sizes the output; the stream decides when it ends.
pub fn inflate_with_consumed(input: &[u8], size_hint: usize) -> Result<(Vec<u8>, usize), GitError> {
    let mut decompressor = Decompress::new(true);
    let mut out: Vec<u8> = Vec::with_capacity(size_hint.max(64));

    loop {
        let consumed = decompressor.total_in() as usize;
        let (before_in, before_out) = (decompressor.total_in(), decompressor.total_out());
        let status = decompressor
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| GitError::InvalidPackFile(format!("corrupt deflate stream: {e}")))?;

        match status {
            Status::StreamEnd => {
                return Ok((out, decompressor.total_in() as usize));
            }
            Status::Ok | Status::BufError => {
                if out.len() == out.capacity() {
                    // Needs more output room; grow and continue.
                    out.reserve(4096);
                    continue;
                }
                let input_exhausted = decompressor.total_in() as usize >= input.len();
                let made_progress = decompressor.total_out() > before_out
                    || decompressor.total_in() > before_in;
                if input_exhausted || !made_progress {
                    return Err(GitError::InvalidPackFile(
                        "deflate stream ended prematurely".to_string(),
                    ));
                }
            }
        }
    }
}

/// Deflate `input` as a single zlib stream.
pub fn deflate(input: &[u8]) -> Result<Vec<u8>, GitError> {
    let mut compressor = Compress::new(Compression::default(), true);
    let mut out: Vec<u8> = Vec::with_capacity(input.len() / 2 + 64);

    loop {
        let consumed = compressor.total_in() as usize;
        let status = compressor
            .compress_vec(&input[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| GitError::PackEncodeError(format!("deflate failed: {e}")))?;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => out.reserve(4096),
        }
    }
}
