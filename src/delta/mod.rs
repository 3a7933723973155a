//! Decoder for Git-style delta instructions that rebuilds target objects from
//! a base buffer and the instruction stream carried by OFS_DELTA / REF_DELTA
//! pack entries (base size + result size + op codes).

use std::io::{ErrorKind, Read};

use crate::errors::GitError;

const COPY_INSTRUCTION_FLAG: u8 = 1 << 7; // msb set => copy from base, otherwise inline data
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;

/// Read a little-endian base-128 varint: 7 payload bits per byte, msb is the
/// continuation flag.
pub fn read_size_encoding(stream: &mut impl Read) -> Result<usize, GitError> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(stream)?;
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > usize::BITS {
            return Err(GitError::DeltaObjectError(
                "size varint overflows".to_string(),
            ));
        }
    }
}

fn read_byte(stream: &mut impl Read) -> Result<u8, GitError> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).map_err(GitError::IOError)?;
    Ok(buf[0])
}

/// Read an integer whose bytes are sparsely present: for each of `bytes`
/// positions, a flag bit in `present_bits` says whether the next stream byte
/// contributes that position.
fn read_partial_int(
    stream: &mut impl Read,
    bytes: u8,
    present_bits: &mut u8,
) -> Result<usize, GitError> {
    let mut value = 0usize;
    for position in 0..bytes {
        if *present_bits & 1 != 0 {
            let byte = read_byte(stream)?;
            value |= (byte as usize) << (position * 8);
        }
        *present_bits >>= 1;
    }
    Ok(value)
}

/// Apply a delta stream to `base_info`, returning the reconstructed target
/// bytes.
///
/// The stream format matches Git's delta encoding:
/// - leading base size, then result size (varint)
/// - sequence of ops: data instructions (msb=0, lower 7 bits = literal
///   length) or copy instructions (msb=1, following bytes encode
///   offset/size; an all-zero size means 0x10000).
///
/// Fails when the declared base size does not match, an instruction reads
/// outside the base, or the produced length differs from the declared result
/// size.
pub fn delta_decode(stream: &mut impl Read, base_info: &[u8]) -> Result<Vec<u8>, GitError> {
    let base_size = read_size_encoding(stream)?;
    if base_info.len() != base_size {
        return Err(GitError::DeltaObjectError(
            "base object len is not equal".to_owned(),
        ));
    }

    let result_size = read_size_encoding(stream)?;
    let mut buffer = Vec::with_capacity(result_size);
    loop {
        // Stream end means the new object is done.
        let instruction = {
            let mut b = [0u8; 1];
            match stream.read_exact(&mut b) {
                Ok(()) => b[0],
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => {
                    return Err(GitError::DeltaObjectError(format!(
                        "wrong instruction in delta: {err}"
                    )));
                }
            }
        };

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            // Data instruction; the instruction byte specifies the number of
            // data bytes. Appending 0 bytes is disallowed by git.
            if instruction == 0 {
                return Err(GitError::DeltaObjectError(
                    "invalid data instruction".to_string(),
                ));
            }
            let mut data = vec![0; instruction as usize];
            stream.read_exact(&mut data).map_err(GitError::IOError)?;
            buffer.extend_from_slice(&data);
        } else {
            // Copy instruction
            let mut nonzero_bytes = instruction;
            let offset = read_partial_int(stream, COPY_OFFSET_BYTES, &mut nonzero_bytes)?;
            let mut size = read_partial_int(stream, COPY_SIZE_BYTES, &mut nonzero_bytes)?;
            if size == 0 {
                size = COPY_ZERO_SIZE;
            }
            let base_data = base_info
                .get(offset..offset + size)
                .ok_or_else(|| GitError::DeltaObjectError("invalid copy instruction".to_string()))?;
            buffer.extend_from_slice(base_data);
        }
    }

    if buffer.len() != result_size {
        return Err(GitError::DeltaObjectError(format!(
            "delta result size mismatch: declared {result_size}, produced {}",
            buffer.len()
        )));
    }
    Ok(buffer)
}

/// Write a varint in the delta size encoding. Used by tests and the delta
/// fixtures the codec tests construct.
pub fn write_size_encoding(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use quickcheck::quickcheck;

    use super::*;

    /// Build a delta stream with one copy op and one literal insert.
    fn sample_delta(base: &[u8], copy_len: u8, literal: &[u8]) -> Vec<u8> {
        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, copy_len as usize + literal.len());
        // copy from offset 0 with explicit one-byte size
        delta.push(COPY_INSTRUCTION_FLAG | 0b0001_0000);
        delta.push(copy_len);
        // literal insert
        delta.push(literal.len() as u8);
        delta.extend_from_slice(literal);
        delta
    }

    /// Copy + insert rebuilds the expected target.
    #[test]
    fn test_copy_and_insert() {
        let base = b"hello\n";
        let delta = sample_delta(base, 5, b" world\n");
        let out = delta_decode(&mut Cursor::new(delta), base).unwrap();
        assert_eq!(out, b"hello world\n");
    }

    /// Mismatched base length is a decoder error.
    #[test]
    fn test_base_size_mismatch() {
        let base = b"hello\n";
        let delta = sample_delta(base, 5, b"!");
        let err = delta_decode(&mut Cursor::new(delta), b"xx").unwrap_err();
        assert!(matches!(err, GitError::DeltaObjectError(_)));
    }

    /// A result shorter than declared is rejected.
    #[test]
    fn test_result_size_mismatch() {
        let base = b"hello\n";
        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, 100); // declares 100 bytes, produces 2
        delta.push(2);
        delta.extend_from_slice(b"ab");
        let err = delta_decode(&mut Cursor::new(delta), base).unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }

    /// Copy ranges outside the base are rejected.
    #[test]
    fn test_copy_out_of_range() {
        let base = b"abc";
        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, 10);
        delta.push(COPY_INSTRUCTION_FLAG | 0b0001_0000);
        delta.push(10); // 10 bytes from offset 0 of a 3-byte base
        let err = delta_decode(&mut Cursor::new(delta), base).unwrap_err();
        assert!(matches!(err, GitError::DeltaObjectError(_)));
    }

    /// A zero-valued data instruction is disallowed.
    #[test]
    fn test_zero_data_instruction() {
        let base = b"abc";
        let mut delta = Vec::new();
        write_size_encoding(&mut delta, base.len());
        write_size_encoding(&mut delta, 1);
        delta.push(0);
        assert!(delta_decode(&mut Cursor::new(delta), base).is_err());
    }

    quickcheck! {
        /// Size varints round-trip for arbitrary values.
        fn prop_size_encoding_round_trip(value: usize) -> bool {
            let mut buf = Vec::new();
            write_size_encoding(&mut buf, value);
            read_size_encoding(&mut Cursor::new(buf)).unwrap() == value
        }
    }
}
