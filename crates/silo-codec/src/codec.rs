use thiserror::Error;

use crate::{BitWriter, Dictionary};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compressed payload is empty")]
    Empty,
    #[error("padding count {0} exceeds the payload")]
    BadPadding(u8),
    #[error("bit stream ends in the middle of a code word")]
    DanglingCode,
}

/// Bit-packs `bytes` with the dictionary codes.
///
/// The returned buffer starts with `write_offset` zero bytes reserved for
/// frame metadata, followed by the packed bits; the final byte is the number
/// of padding bits in the byte before it, not data.
pub fn compress(dict: &Dictionary, bytes: &[u8], write_offset: usize) -> Vec<u8> {
    let mut bits = BitWriter::with_byte_capacity(bytes.len());
    for &b in bytes {
        let code = dict.code(b);
        for j in 0..code.len {
            bits.push(((code.bits >> (code.len - 1 - j)) & 0x1) as u8);
        }
    }

    let pad = ((8 - bits.n_bits() % 8) % 8) as u8;
    let mut out = vec![0; write_offset];
    out.reserve(bits.as_bytes().len() + 1);
    out.extend_from_slice(bits.as_bytes());
    out.push(pad);
    out
}

/// Unpacks a compressed payload by walking the decode trie MSB-first,
/// emitting a symbol at every leaf. The trailing byte of `bytes` is the
/// padding count declared by the compressor.
pub fn decompress(dict: &Dictionary, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let Some((&pad, packed)) = bytes.split_last() else {
        return Err(CodecError::Empty);
    };
    if pad > 7 || usize::from(pad) > packed.len() * 8 {
        return Err(CodecError::BadPadding(pad));
    }
    let n_bits = packed.len() * 8 - usize::from(pad);

    let mut out = Vec::with_capacity(n_bits / 8);
    let mut node = dict.root();
    for i in 0..n_bits {
        let one = (packed[i / 8] >> (7 - i % 8)) & 0x1 == 1;
        node = node.child(one).ok_or(CodecError::DanglingCode)?;
        if node.is_leaf() {
            out.push(node.symbol());
            node = dict.root();
        }
    }
    // a walk left hanging past the declared bits is a malformed encoding
    if !std::ptr::eq(node, dict.root()) {
        return Err(CodecError::DanglingCode);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{identity_blob, nine_bit_blob};

    fn identity() -> Dictionary {
        Dictionary::parse(&identity_blob()).unwrap()
    }

    fn nine_bit() -> Dictionary {
        Dictionary::parse(&nine_bit_blob()).unwrap()
    }

    #[test]
    fn round_trips_with_byte_aligned_codes() {
        let dict = identity();
        for payload in [&b"hello"[..], b"", b"\x00\xff\x00", b"aaaaaaaaaaaaaaaa"] {
            let out = compress(&dict, payload, 0);
            assert_eq!(decompress(&dict, &out).unwrap(), payload);
        }
    }

    #[test]
    fn round_trips_all_symbols() {
        let dict = nine_bit();
        let payload: Vec<u8> = (0..=255).collect();
        let out = compress(&dict, &payload, 0);
        assert_eq!(decompress(&dict, &out).unwrap(), payload);
    }

    #[test]
    fn declares_the_padding_count() {
        let dict = nine_bit();
        // three nine-bit codes: 27 bits, 5 bits of padding in the tail byte
        let out = compress(&dict, b"abc", 0);
        assert_eq!(out.len(), 4 + 1);
        assert_eq!(out[out.len() - 1], 5);
        assert_eq!(decompress(&dict, &out).unwrap(), b"abc");
    }

    #[test]
    fn identity_codes_pack_verbatim() {
        let dict = identity();
        let out = compress(&dict, b"hi", 0);
        // two 8-bit codes, no padding, one trailing pad-count byte
        assert_eq!(out, vec![b'h', b'i', 0]);
    }

    #[test]
    fn reserves_the_metadata_prefix() {
        let dict = identity();
        let out = compress(&dict, b"abc", 9);
        assert_eq!(&out[..9], &[0; 9]);
        assert_eq!(decompress(&dict, &out[9..]).unwrap(), b"abc");
    }

    #[test]
    fn empty_payload_is_one_padding_byte() {
        let dict = identity();
        let out = compress(&dict, b"", 0);
        assert_eq!(out, vec![0]);
        assert_eq!(decompress(&dict, &out).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(decompress(&identity(), &[]), Err(CodecError::Empty)));
    }

    #[test]
    fn rejects_bogus_padding_count() {
        assert!(matches!(
            decompress(&identity(), &[0xAB, 200]),
            Err(CodecError::BadPadding(200))
        ));
        assert!(matches!(decompress(&identity(), &[3]), Err(CodecError::BadPadding(3))));
    }

    #[test]
    fn rejects_dangling_code() {
        let dict = nine_bit();
        let mut out = compress(&dict, b"xy", 0);
        // chop the last data byte but keep a zero pad count: the final code
        // word is now cut short
        out.truncate(out.len() - 2);
        out.push(0);
        assert!(matches!(decompress(&dict, &out), Err(CodecError::DanglingCode)));
    }
}
