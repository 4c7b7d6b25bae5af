//! Short deterministic identifiers for ipset names.

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha1::{Digest, Sha1};

// 85 printable ASCII characters. Space, comma, single quote, and backslash
// are omitted: comma is the list:set entry separator, the others are hostile
// to shells.
const SYMBOLS: &[u8; 85] = b"0123456789\
abcdefghijklmnopqrstuvwxyz\
ABCDEFGHIJKLMNOPQRSTUVWXYZ\
!#$%&()*+-./:;<=>?@^_{}";

/// SHA-1 hash an arbitrary string and render the digest in base 85.
///
/// Digits are emitted least-significant first, for as long as the quotient is
/// at least the base, so the output length varies but never exceeds 25
/// characters: prefixed with `weave-` it fits the 31-character ipset name
/// limit.
pub fn short_name(arbitrary: &str) -> String {
    let digest = Sha1::digest(arbitrary.as_bytes());
    let mut i = BigUint::from_bytes_be(&digest);
    let base = BigUint::from(SYMBOLS.len());

    let mut result = String::new();

    while i >= base {
        let remainder = &i % &base;
        i -= &remainder;
        i /= &base;
        let symbol = SYMBOLS[remainder.to_usize().unwrap_or(0)];
        result.push(char::from(symbol));
    }

    result
}
