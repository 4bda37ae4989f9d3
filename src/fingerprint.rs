//! 32-bit token fingerprints.
//!
//! Identifiers, operators, string literals and assembler labels are all
//! keyed by the same accumulation: seed 5381, multiplier 31, wrapping
//! 32-bit arithmetic. Collisions are rare enough that fingerprints are
//! used as keys without a confirming byte compare.

/// Fingerprint seed.
pub const SEED: u32 = 5381;

/// Fold one byte into a running fingerprint.
#[inline]
pub const fn step(acc: u32, byte: u8) -> u32 {
    acc.wrapping_mul(31).wrapping_add(byte as u32)
}

/// Fingerprint of a byte slice.
pub const fn fingerprint(bytes: &[u8]) -> u32 {
    let mut acc = SEED;
    let mut i = 0;
    while i < bytes.len() {
        acc = step(acc, bytes[i]);
        i += 1;
    }
    acc
}

/// Fingerprint of a string, usable in `const` position for token and
/// intrinsic dispatch tables.
pub const fn fp(s: &str) -> u32 {
    fingerprint(s.as_bytes())
}

/// Fingerprint prefix shared by every string literal: the accumulation
/// begins as if the opening delimiter were a `"` byte.
pub const STRING_SEED: u32 = step(SEED, b'"');

/// Fingerprint shared by every numeric literal; the value itself is
/// reported out of band.
pub const NUMBER_FP: u32 = step(SEED, b'#');

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_prefix_accumulation() {
        // hash("\"A") = ((5381*31)+'"')*31 + 'A'
        let expected = (5381u32 * 31 + u32::from(b'"')) * 31 + u32::from(b'A');
        assert_eq!(step(STRING_SEED, b'A'), expected);
        assert_eq!(fingerprint(b"\"A"), expected);
    }

    #[test]
    fn compound_operator() {
        // "<<=" = (((5381*31)+'<')*31+'<')*31+'='
        let mut acc = SEED;
        for b in [b'<', b'<', b'='] {
            acc = acc.wrapping_mul(31).wrapping_add(u32::from(b));
        }
        assert_eq!(fp("<<="), acc);
    }

    #[test]
    fn distinct_over_common_keywords() {
        let words = [
            "var", "const", "function", "return", "if", "else", "while", "do", "for", "break",
            "continue", "of", "in", "new", "true", "false", "null", "undefined",
        ];
        for (i, a) in words.iter().enumerate() {
            for b in &words[i + 1..] {
                assert_ne!(fp(a), fp(b), "{a} vs {b}");
            }
        }
    }
}
