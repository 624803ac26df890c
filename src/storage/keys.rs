// Key codec - physical key layout
//
// Entity keys are a one byte discriminator followed by the 49 byte packed
// identifier. Membership and edge records concatenate two entity keys so that
// a prefix scan over the first key lists the members. Singleton records use a
// bare discriminator byte and can never collide with the 50 byte entity keys.

use crate::convert::{Hash, PACKED_LEN};

/// Length of an entity key
pub const KEY_LEN: usize = 1 + PACKED_LEN;

/// Discriminators, one per index kind
pub mod kind {
    pub const HASH: u8 = 1;
    pub const TIMESTAMP: u8 = 2;
    pub const BYTES: u8 = 3;
    pub const VALUE: u8 = 4;
    pub const ADDRESS_HASH: u8 = 5;
    pub const BUNDLE: u8 = 6;
    pub const TAG: u8 = 7;
    pub const ADDRESS: u8 = 8;
    pub const RELATION: u8 = 9;
    pub const APPROVEE: u8 = 10;
    pub const CONFIRMED: u8 = 11;
    pub const SPENT: u8 = 12;
    pub const BALANCE: u8 = 13;
    pub const SNAPSHOT_BALANCE: u8 = 14;
    pub const SNAPSHOT_SPENT: u8 = 15;
    pub const ADDRESS_BYTES: u8 = 16;
    pub const PENDING_BUNDLE: u8 = 17;
    pub const PRUNABLE: u8 = 18;
    pub const BUNDLE_HASH: u8 = 19;
    pub const TAG_HASH: u8 = 20;
    pub const SNAPSHOT_DATE: u8 = 30;
    pub const SNAPSHOT_LOCK: u8 = 31;
}

/// Key for the record of `kind` belonging to `id`
pub fn key(id: &Hash, kind: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.push(kind);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Concatenate two keys into an edge or membership key
pub fn composite(first: &[u8], second: &[u8]) -> Vec<u8> {
    [first, second].concat()
}

/// Key of a singleton record such as the snapshot date
pub fn singleton(kind: u8) -> [u8; 1] {
    [kind]
}

/// Prefix selecting every record of one kind
pub fn prefix(kind: u8) -> [u8; 1] {
    [kind]
}

/// Extract the identifier from an entity key
pub fn id_of(key: &[u8]) -> Option<Hash> {
    key.get(1..KEY_LEN).and_then(|bytes| Hash::from_slice(bytes).ok())
}

/// Extract the identifier of the second half of a composite key
pub fn member_of(key: &[u8]) -> Option<Hash> {
    key.get(KEY_LEN + 1..KEY_LEN * 2)
        .and_then(|bytes| Hash::from_slice(bytes).ok())
}
