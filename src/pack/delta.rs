//! Git delta instruction streams.
//!
//! A delta starts with two LEB128 varints (base size, result size) followed
//! by a sequence of instructions:
//! - copy (`1xxxxxxx`): low four bits select little-endian offset bytes,
//!   next three bits select size bytes; a zero size means `0x10000`.
//! - insert (`0xxxxxxx`, non-zero): the next `cmd` bytes are literal data.
//!
//! Opcode `0x00` is reserved and rejected.

use thiserror::Error;

/// Largest copy a single instruction can encode without the 4th size byte.
const MAX_COPY: usize = 0xff_ffff;

/// Largest literal run a single insert instruction can carry.
const MAX_INSERT: usize = 0x7f;

/// Upper bound on the output buffer reserved before any instruction runs.
const MAX_PREALLOC: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,
    #[error("delta varint overflow")]
    VarintOverflow,
    #[error("delta base size mismatch (delta expects {expected}, base has {actual})")]
    BaseSizeMismatch { expected: usize, actual: usize },
    #[error("delta result size mismatch")]
    ResultSizeMismatch,
    #[error("delta command zero")]
    BadCommandZero,
    #[error("delta copy out of range")]
    CopyOutOfRange,
    #[error("delta output overrun")]
    OutputOverrun,
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<usize, DeltaError> {
    let mut shift: u32 = 0;
    let mut result: u64 = 0;

    loop {
        let b = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;

        result |= ((b & 0x7f) as u64) << shift;
        if (b & 0x80) == 0 {
            return usize::try_from(result).map_err(|_| DeltaError::VarintOverflow);
        }
        shift += 7;
        if shift > 63 {
            return Err(DeltaError::VarintOverflow);
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Parse the base and result sizes from a delta header.
pub fn sizes(delta: &[u8]) -> Result<(usize, usize), DeltaError> {
    let mut pos = 0usize;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;
    Ok((base_size, result_size))
}

/// Apply `delta` to `base`, returning the patched bytes.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0usize;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(DeltaError::BaseSizeMismatch {
            expected: base_size,
            actual: base.len(),
        });
    }

    // the declared result size is untrusted; each instruction yields at most 64 KiB
    let mut out = Vec::with_capacity(
        result_size
            .min(delta.len().saturating_mul(0x10000))
            .min(MAX_PREALLOC),
    );
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if (cmd & 0x80) != 0 {
            let (off, size) = decode_copy_params(delta, &mut pos, cmd)?;
            let end = off.checked_add(size).ok_or(DeltaError::CopyOutOfRange)?;
            if end > base.len() {
                return Err(DeltaError::CopyOutOfRange);
            }
            if out.len() + size > result_size {
                return Err(DeltaError::OutputOverrun);
            }
            out.extend_from_slice(&base[off..end]);
        } else if cmd != 0 {
            let size = cmd as usize;
            if pos + size > delta.len() {
                return Err(DeltaError::Truncated);
            }
            if out.len() + size > result_size {
                return Err(DeltaError::OutputOverrun);
            }
            out.extend_from_slice(&delta[pos..pos + size]);
            pos += size;
        } else {
            return Err(DeltaError::BadCommandZero);
        }
    }

    if out.len() != result_size {
        return Err(DeltaError::ResultSizeMismatch);
    }
    Ok(out)
}

fn decode_copy_params(
    delta: &[u8],
    pos: &mut usize,
    cmd: u8,
) -> Result<(usize, usize), DeltaError> {
    let mut next = |bit: u8, shift: u32| -> Result<usize, DeltaError> {
        if cmd & bit == 0 {
            return Ok(0);
        }
        let b = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        Ok((b as usize) << shift)
    };

    let off = next(0x01, 0)? | next(0x02, 8)? | next(0x04, 16)? | next(0x08, 24)?;
    let mut size = next(0x10, 0)? | next(0x20, 8)? | next(0x40, 16)?;
    if size == 0 {
        size = 0x10000;
    }
    Ok((off, size))
}

fn push_copy(out: &mut Vec<u8>, mut off: usize, mut len: usize) {
    while len > 0 {
        let chunk = len.min(MAX_COPY);
        let mut cmd = 0x80u8;
        let mut args = Vec::with_capacity(7);
        for i in 0..4 {
            let b = ((off >> (8 * i)) & 0xff) as u8;
            if b != 0 {
                cmd |= 1 << i;
                args.push(b);
            }
        }
        for i in 0..3 {
            let b = ((chunk >> (8 * i)) & 0xff) as u8;
            if b != 0 {
                cmd |= 0x10 << i;
                args.push(b);
            }
        }
        out.push(cmd);
        out.extend_from_slice(&args);
        off += chunk;
        len -= chunk;
    }
}

fn push_insert(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

/// Build a delta that turns `base` into `target`.
///
/// Copies the longest shared prefix and suffix from `base` and inserts the
/// differing middle literally. Not a general-purpose differ, but every
/// instruction kind the decoder understands is produced.
pub fn encode(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, base.len());
    write_varint(&mut out, target.len());

    let prefix = base
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    push_copy(&mut out, 0, prefix);
    push_insert(&mut out, &target[prefix..target.len() - suffix]);
    push_copy(&mut out, base.len() - suffix, suffix);
    out
}
