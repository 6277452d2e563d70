//! Zero-run compression for serialized packet headers.
//!
//! Most of a simulated packet's header region is zero, so event payloads
//! shrink well under a run-length scheme that only elides zeros. The
//! encoded stream is a sequence of runs: a control word packing
//! `(start offset: low 16 bits, length: high 16 bits)` followed by
//! `length` non-zero-region words, terminated by an all-zero control word.
//! A single isolated zero inside a non-zero run is kept as data; only two
//! or more consecutive zero words start a skip, which keeps short gaps
//! from paying a control-word's overhead.

use thiserror::Error;

/// Largest input the 16-bit control-word offset can address.
pub const MAX_WORDS: usize = 1 << 16;

/// Longest run one control word can describe; longer runs are split.
const MAX_RUN: u32 = (1 << 16) - 1;

/// Error type for encoding or decoding a zero-run stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("source of {words} words exceeds the {MAX_WORDS}-word limit")]
    TooLarge { words: usize },
    #[error("run at offset {offset} length {len} exceeds target capacity {capacity}")]
    RunOutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("stream truncated inside a run")]
    Truncated,
}

/// Compress `src` into a fresh word vector.
///
/// `src` must hold at most [MAX_WORDS] words. The output carries one
/// control word per run plus the terminator, so an input with no zeros at
/// all encodes two words longer than it started. A run longer than the
/// 16-bit length field spans several control words.
pub fn encode(src: &[u32]) -> Result<Vec<u32>, Error> {
    if src.len() > MAX_WORDS {
        return Err(Error::TooLarge { words: src.len() });
    }
    let mut out = Vec::with_capacity(src.len() + 2);
    let mut offset = 0;
    let mut skipping = true;
    let mut control = 0;
    let mut len: u32 = 0;
    while offset < src.len() {
        if skipping {
            if src[offset] == 0 {
                offset += 1;
                continue;
            }
            // Run starts here; length is patched in when it closes.
            skipping = false;
            control = out.len();
            out.push(offset as u32);
            len = 0;
        }
        if src[offset] == 0 && offset + 1 < src.len() && src[offset + 1] == 0 {
            // Two zeros in a row: close the run and resume skipping.
            out[control] |= len << 16;
            skipping = true;
            offset += 1;
            continue;
        }
        out.push(src[offset]);
        offset += 1;
        len += 1;
        if len == MAX_RUN {
            // The length field saturates; the remainder opens a new run.
            out[control] |= len << 16;
            skipping = true;
        }
    }
    if !skipping {
        out[control] |= len << 16;
    }
    out.push(0);
    Ok(out)
}

/// Decompress `src` into `dst`, returning one past the last offset written.
///
/// `dst` must be zero-filled on entry: positions not covered by any run are
/// never written and must already read as zero.
pub fn decode(src: &[u32], dst: &mut [u32]) -> Result<usize, Error> {
    let mut written = 0;
    let mut i = 0;
    while i < src.len() {
        let control = src[i];
        i += 1;
        if control == 0 {
            break;
        }
        let offset = (control & 0xffff) as usize;
        let len = (control >> 16) as usize;
        if offset + len > dst.len() {
            return Err(Error::RunOutOfBounds {
                offset,
                len,
                capacity: dst.len(),
            });
        }
        if i + len > src.len() {
            return Err(Error::Truncated);
        }
        dst[offset..offset + len].copy_from_slice(&src[i..i + len]);
        i += len;
        written = offset + len;
    }
    Ok(written)
}
