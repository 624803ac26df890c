// Convert module - TERNARY IDENTIFIERS
// Packs 81-tryte identifiers into fixed-width binary keys and back

mod trytes;

pub use trytes::{
    bytes_to_trits, is_trytes, trits_to_bytes, trits_to_trytes, trytes_to_trits, ConvertError,
    Hash, HASH_TRYTES, PACKED_LEN, TRYTE_ALPHABET,
};
