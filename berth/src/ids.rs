//! Short identifiers for correlation ids and resource uuids.

/// Base-57 alphabet (no `0`, `1`, `I`, `O`, `l`): what every uuid in the
/// protocol is made of.
const ALPHABET: [char; 57] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L',
    'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f',
    'g', 'h', 'i', 'j', 'k', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

pub(crate) const ID_LEN: usize = 22;

/// A fresh 22-character identifier.
pub(crate) fn new_id() -> String {
    nanoid::nanoid!(ID_LEN, &ALPHABET)
}

/// Whether `s` is shaped like an identifier from [`new_id`]. Tags must not
/// look like one, or key-string lookup would be ambiguous.
pub(crate) fn looks_like_id(s: &str) -> bool {
    s.len() == ID_LEN && s.chars().all(|c| ALPHABET.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_look_like_ids() {
        for _ in 0..64 {
            assert!(looks_like_id(&new_id()));
        }
    }

    #[test]
    fn other_shapes_do_not() {
        assert!(!looks_like_id("web"));
        assert!(!looks_like_id("a-very-long-tag-name-xx")); // 23 chars
        assert!(!looks_like_id("has-dash-in-it-padding")); // 22 chars, bad alphabet
    }
}
