//! EWAH-compressed bitmaps for the persisted extension.
//!
//! Enhanced Word-Aligned Hybrid encoding over 64-bit words: the buffer
//! alternates *run-length words* and literal words. A run-length word packs
//! a run bit (bit 0), a 32-bit count of words filled with that bit, and a
//! 31-bit count of literal words following it. Bits must be added in
//! increasing positions, which is exactly how dirty index positions arrive.

use std::error;
use std::fmt;

const RUN_LEN_BITS: u64 = 32;
const MAX_RUN_LEN: u64 = (1 << RUN_LEN_BITS) - 1;
const MAX_LITERALS: u64 = (1 << 31) - 1;
const LITERAL_SHIFT: u64 = RUN_LEN_BITS + 1;

/// A malformed serialized bitmap.
#[derive(Debug, PartialEq, Eq)]
pub enum EwahError {
    /// The payload ended before the declared word count.
    Truncated,
    /// The run-length word index points outside the buffer.
    BadRlwOffset(u32),
    /// A literal count points past the end of the buffer.
    BadStructure,
}

impl fmt::Display for EwahError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EwahError::Truncated => write!(f, "bitmap payload truncated"),
            EwahError::BadRlwOffset(off) => write!(f, "run-length word offset {off} out of range"),
            EwahError::BadStructure => write!(f, "literal count exceeds buffer"),
        }
    }
}

impl error::Error for EwahError {}

/// An EWAH-compressed bit vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EwahBitmap {
    buffer: Vec<u64>,
    /// Index of the active run-length word in `buffer`.
    rlw: usize,
    /// Number of bits represented so far.
    bit_size: u64,
}

impl Default for EwahBitmap {
    fn default() -> Self {
        Self::new()
    }
}

fn run_bit(word: u64) -> bool {
    word & 1 != 0
}

fn run_len(word: u64) -> u64 {
    (word >> 1) & MAX_RUN_LEN
}

fn literal_count(word: u64) -> u64 {
    word >> LITERAL_SHIFT
}

impl EwahBitmap {
    /// An empty bitmap.
    pub fn new() -> Self {
        EwahBitmap {
            buffer: vec![0],
            rlw: 0,
            bit_size: 0,
        }
    }

    /// Number of bits represented (one past the highest set position).
    pub fn bit_size(&self) -> u64 {
        self.bit_size
    }

    /// Set bit `pos`. Positions must arrive in strictly increasing order.
    pub fn set(&mut self, pos: u64) {
        debug_assert!(
            pos >= self.bit_size,
            "bits must be set in increasing order ({pos} < {})",
            self.bit_size
        );
        let word_idx = pos / 64;
        let cur_words = self.bit_size.div_ceil(64);
        self.bit_size = pos + 1;

        if word_idx >= cur_words {
            let gap = word_idx - cur_words;
            if gap > 0 {
                self.add_empty_words(gap);
            }
            self.add_literal(1u64 << (pos % 64));
        } else {
            // Same word as the previous set bit; that word is the last
            // literal by construction.
            let last = self.buffer.len() - 1;
            self.buffer[last] |= 1u64 << (pos % 64);
        }
    }

    /// Call `f` with every set position, in increasing order.
    pub fn each_bit<F: FnMut(u64)>(&self, mut f: F) {
        let mut pos = 0u64;
        let mut i = 0usize;
        while i < self.buffer.len() {
            let rlw = self.buffer[i];
            let run = run_len(rlw);
            if run_bit(rlw) {
                for offset in 0..run * 64 {
                    f(pos + offset);
                }
            }
            pos += run * 64;

            let literals = literal_count(rlw) as usize;
            for j in 0..literals {
                let mut word = self.buffer[i + 1 + j];
                while word != 0 {
                    let bit = word.trailing_zeros() as u64;
                    f(pos + bit);
                    word &= word - 1;
                }
                pos += 64;
            }
            i += 1 + literals;
        }
    }

    /// Collect every set position; test convenience.
    pub fn to_positions(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.each_bit(|pos| out.push(pos));
        out
    }

    /// Append the big-endian serialized form: bit count, word count, the
    /// words, and the active run-length word offset.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.bit_size as u32).to_be_bytes());
        out.extend_from_slice(&(self.buffer.len() as u32).to_be_bytes());
        for word in &self.buffer {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&(self.rlw as u32).to_be_bytes());
    }

    /// Parse a serialized bitmap; returns the bitmap and the bytes consumed.
    pub fn deserialize(data: &[u8]) -> Result<(EwahBitmap, usize), EwahError> {
        let bit_size = u64::from(read_u32(data, 0)?);
        let words = read_u32(data, 4)? as usize;
        let mut buffer = Vec::with_capacity(words.max(1));
        let mut offset = 8usize;
        for _ in 0..words {
            let end = offset + 8;
            let chunk = data.get(offset..end).ok_or(EwahError::Truncated)?;
            buffer.push(u64::from_be_bytes(
                chunk.try_into().map_err(|_| EwahError::Truncated)?,
            ));
            offset = end;
        }
        let rlw = read_u32(data, offset)?;
        offset += 4;

        if buffer.is_empty() {
            buffer.push(0);
        }
        if (rlw as usize) >= buffer.len() {
            return Err(EwahError::BadRlwOffset(rlw));
        }
        let bitmap = EwahBitmap {
            buffer,
            rlw: rlw as usize,
            bit_size,
        };
        bitmap.validate()?;
        Ok((bitmap, offset))
    }

    /// Structural check: every literal count stays inside the buffer.
    fn validate(&self) -> Result<(), EwahError> {
        let mut i = 0usize;
        while i < self.buffer.len() {
            let literals = literal_count(self.buffer[i]) as usize;
            i = i
                .checked_add(1 + literals)
                .ok_or(EwahError::BadStructure)?;
            if i > self.buffer.len() {
                return Err(EwahError::BadStructure);
            }
        }
        Ok(())
    }

    fn add_empty_words(&mut self, mut count: u64) {
        while count > 0 {
            let cur = self.buffer[self.rlw];
            if literal_count(cur) == 0 && !run_bit(cur) {
                let room = MAX_RUN_LEN - run_len(cur);
                let take = count.min(room);
                self.buffer[self.rlw] = cur + (take << 1);
                count -= take;
            }
            if count > 0 {
                self.push_rlw();
            }
        }
    }

    fn add_literal(&mut self, word: u64) {
        if literal_count(self.buffer[self.rlw]) == MAX_LITERALS {
            self.push_rlw();
        }
        self.buffer[self.rlw] += 1 << LITERAL_SHIFT;
        self.buffer.push(word);
    }

    fn push_rlw(&mut self) {
        self.buffer.push(0);
        self.rlw = self.buffer.len() - 1;
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, EwahError> {
    let chunk = data.get(offset..offset + 4).ok_or(EwahError::Truncated)?;
    Ok(u32::from_be_bytes(
        chunk.try_into().map_err(|_| EwahError::Truncated)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_of(positions: &[u64]) -> EwahBitmap {
        let mut bitmap = EwahBitmap::new();
        for &pos in positions {
            bitmap.set(pos);
        }
        bitmap
    }

    #[test]
    fn dense_bits_round_trip() {
        let positions: Vec<u64> = (0..200).collect();
        assert_eq!(bitmap_of(&positions).to_positions(), positions);
    }

    #[test]
    fn sparse_bits_compress_into_runs() {
        let positions = [0u64, 63, 64, 1_000_000];
        let bitmap = bitmap_of(&positions);
        assert_eq!(bitmap.to_positions(), positions);
        // ~15k zero words collapse into a run, not literals.
        assert!(bitmap.buffer.len() < 10, "buffer: {:?}", bitmap.buffer.len());
    }

    #[test]
    fn serialize_round_trip() {
        for positions in [
            vec![],
            vec![0],
            vec![5, 6, 7, 130],
            (0..500).step_by(7).collect::<Vec<u64>>(),
            vec![1 << 20],
        ] {
            let bitmap = bitmap_of(&positions);
            let mut bytes = Vec::new();
            bitmap.serialize(&mut bytes);

            let (parsed, consumed) = EwahBitmap::deserialize(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(parsed.to_positions(), positions);
            assert_eq!(parsed.bit_size(), bitmap.bit_size());
        }
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert_eq!(EwahBitmap::deserialize(&[1, 2]), Err(EwahError::Truncated));

        // Declares two words but carries none.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        assert_eq!(EwahBitmap::deserialize(&bytes), Err(EwahError::Truncated));

        // RLW offset out of range.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&9u32.to_be_bytes());
        assert_eq!(
            EwahBitmap::deserialize(&bytes),
            Err(EwahError::BadRlwOffset(9))
        );

        // Literal count pointing past the buffer.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(7u64 << 33).to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(
            EwahBitmap::deserialize(&bytes),
            Err(EwahError::BadStructure)
        );
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let bitmap = bitmap_of(&[1, 2, 3]);
        let mut bytes = Vec::new();
        bitmap.serialize(&mut bytes);
        let payload_len = bytes.len();
        bytes.extend_from_slice(b"extra");

        let (parsed, consumed) = EwahBitmap::deserialize(&bytes).unwrap();
        assert_eq!(consumed, payload_len);
        assert_eq!(parsed.to_positions(), vec![1, 2, 3]);
    }
}
