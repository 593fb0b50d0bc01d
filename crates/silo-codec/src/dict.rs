use std::{fs, io, path::Path};

use thiserror::Error;

/// Number of symbols a dictionary always covers.
pub const DICT_SYMBOLS: usize = 256;
/// Conventional dictionary file name, looked up in the working directory.
pub const DICT_FILE_NAME: &str = "compression.dict";

#[derive(Error, Debug)]
pub enum DictError {
    #[error("unable to read dictionary: {0}")]
    Io(#[from] io::Error),
    #[error("dictionary blob ends inside symbol {0}")]
    Truncated(usize),
    #[error("symbol {symbol} has invalid code length {len}")]
    BadCodeLen { symbol: usize, len: u8 },
}

/// One symbol's code word, right-aligned: the first (most significant) bit of
/// the code is `bits >> (len - 1)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Code {
    pub bits: u32,
    pub len: u8,
}

/// Decode trie node. A node with no children is a leaf carrying a symbol.
#[derive(Debug, Default)]
pub(crate) struct Node {
    symbol: u8,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    #[inline]
    pub(crate) fn child(&self, bit_is_one: bool) -> Option<&Self> {
        if bit_is_one { self.right.as_deref() } else { self.left.as_deref() }
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    #[inline]
    pub(crate) fn symbol(&self) -> u8 {
        self.symbol
    }
}

/// Immutable symbol dictionary: the encode table and its decode trie.
///
/// Built from a bit-packed blob laying out, for each symbol 0..=255 in order,
/// an 8-bit code length followed by that many code bits, MSB-first and
/// contiguous across byte boundaries. Assumes no code is a prefix of another.
pub struct Dictionary {
    encode: [Code; DICT_SYMBOLS],
    decode: Node,
}

impl Dictionary {
    pub fn parse(blob: &[u8]) -> Result<Self, DictError> {
        let mut cursor = BitCursor { bytes: blob, pos: 0 };
        let mut encode = [Code::default(); DICT_SYMBOLS];
        for (symbol, slot) in encode.iter_mut().enumerate() {
            let len = cursor.take(8).ok_or(DictError::Truncated(symbol))? as u8;
            if len == 0 || len > 32 {
                return Err(DictError::BadCodeLen { symbol, len });
            }
            let bits = cursor.take(len as usize).ok_or(DictError::Truncated(symbol))? as u32;
            *slot = Code { bits, len };
        }

        let mut decode = Node::default();
        for (symbol, code) in encode.iter().enumerate() {
            let mut node = &mut decode;
            for j in 0..code.len {
                let one = (code.bits >> (code.len - 1 - j)) & 0x1 == 1;
                let child = if one { &mut node.right } else { &mut node.left };
                node = child.get_or_insert_with(Box::default);
            }
            node.symbol = symbol as u8;
        }

        Ok(Self { encode, decode })
    }

    /// Reads and parses a dictionary file, typically [`DICT_FILE_NAME`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DictError> {
        Self::parse(&fs::read(path)?)
    }

    #[inline]
    pub fn code(&self, symbol: u8) -> Code {
        self.encode[symbol as usize]
    }

    #[inline]
    pub(crate) fn root(&self) -> &Node {
        &self.decode
    }
}

/// MSB-first bit reader over a byte slice.
struct BitCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl BitCursor<'_> {
    /// Takes the next `n` bits, left-padded to a 64-bit value, or `None` if
    /// the blob runs out.
    fn take(&mut self, n: usize) -> Option<u64> {
        if self.pos + n > self.bytes.len() * 8 {
            return None;
        }
        let mut out = 0u64;
        for _ in 0..n {
            let bit = (self.bytes[self.pos / 8] >> (7 - self.pos % 8)) & 0x1;
            out = (out << 1) | u64::from(bit);
            self.pos += 1;
        }
        Some(out)
    }
}

/// Fixed-length test dictionary: every symbol codes to its own 8-bit value.
#[cfg(test)]
pub(crate) fn identity_blob() -> Vec<u8> {
    let mut blob = Vec::with_capacity(2 * DICT_SYMBOLS);
    for symbol in 0..DICT_SYMBOLS {
        blob.push(8);
        blob.push(symbol as u8);
    }
    blob
}

/// 9-bit test dictionary (symbol `i` codes to `2 * i`), packed through a bit
/// writer so entries straddle byte boundaries.
#[cfg(test)]
pub(crate) fn nine_bit_blob() -> Vec<u8> {
    let mut bits = crate::BitWriter::with_byte_capacity(DICT_SYMBOLS * 3);
    for symbol in 0..DICT_SYMBOLS as u32 {
        let code = symbol * 2;
        for j in 0..8 {
            bits.push(((9 >> (7 - j)) & 0x1) as u8);
        }
        for j in 0..9 {
            bits.push(((code >> (8 - j)) & 0x1) as u8);
        }
    }
    bits.as_bytes().to_vec()
}
