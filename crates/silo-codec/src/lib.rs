//! Symbol-wise prefix-code compression: a 256-entry encode dictionary with a
//! binary decode trie, and the bit-packed payload codec built on top of them.

mod bits;
mod codec;
mod dict;

pub use bits::BitWriter;
pub use codec::{CodecError, compress, decompress};
pub use dict::{Code, DICT_FILE_NAME, DICT_SYMBOLS, DictError, Dictionary};
