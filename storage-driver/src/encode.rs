//! Escaping for caller-supplied path segments.
//!
//! Every identifier that ends up inside a storage path goes through [`encode`]
//! first, so that no namespace, repository, image id or tag name can introduce
//! a separator or a relative component into the hierarchy.

use std::borrow::Cow;
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Escape token for a segment which is exactly `.`.
pub const DOT: &str = "%2E";

/// Escape token for a segment which is exactly `..`.
pub const DOT_DOT: &str = "%2E%2E";

/// Escape token for an empty value. Form encoding never produces `%20`
/// itself, since spaces become `+`.
pub const EMPTY: &str = "%20";

/// Bytes left alone by form encoding: ASCII alphanumerics and `_ . -`.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'-');

/// Encode a value for use as a single path segment.
///
/// The empty string, `.` and `..` map to fixed escape tokens, so every
/// encoded value is a single non-empty segment. Anything else is form-encoded:
/// spaces become `+` and every byte outside `[A-Za-z0-9_.-]` becomes `%XX`.
///
/// ```
/// use registry_storage_driver::encode;
///
/// assert_eq!(encode(".."), "%2E%2E");
/// assert_eq!(encode("library/ubuntu"), "library%2Fubuntu");
/// assert_eq!(encode("my tag"), "my+tag");
/// ```
pub fn encode<T: fmt::Display + ?Sized>(value: &T) -> String {
    let value = value.to_string();
    match value.as_str() {
        "" => EMPTY.to_owned(),
        "." => DOT.to_owned(),
        ".." => DOT_DOT.to_owned(),
        other => other
            .split(' ')
            .map(|part| utf8_percent_encode(part, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("+"),
    }
}

/// Recover the raw value of a segment produced by [`encode`].
///
/// Segments which are not valid encoder output are decoded leniently; invalid
/// UTF-8 is replaced rather than rejected.
pub fn decode(segment: &str) -> String {
    if segment == EMPTY {
        return String::new();
    }
    let plus_free: Cow<'_, str> = if segment.contains('+') {
        Cow::Owned(segment.replace('+', " "))
    } else {
        Cow::Borrowed(segment)
    };
    percent_decode_str(&plus_free)
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn dots_are_neutralized() {
        assert_eq!(encode("."), DOT);
        assert_eq!(encode(".."), DOT_DOT);
        assert_eq!(encode("..."), "...");
        assert_eq!(encode("../etc"), "..%2Fetc");
    }

    #[test]
    fn escape_tokens_do_not_collide_with_raw_input() {
        assert_eq!(encode("%2E"), "%252E");
        assert_ne!(encode("%2E"), encode("."));
        assert_ne!(encode("%2E%2E"), encode(".."));
    }

    #[test]
    fn form_encoding() {
        assert_eq!(encode("abc123"), "abc123");
        assert_eq!(encode("a b"), "a+b");
        assert_eq!(encode("a+b"), "a%2Bb");
        assert_eq!(encode("~user"), "%7Euser");
        assert_eq!(encode("caf\u{e9}"), "caf%C3%A9");
        assert_eq!(encode(&42), "42");
        assert_eq!(encode(""), EMPTY);
        assert_eq!(encode(" "), "+");
    }

    #[test]
    fn decode_inverts_escape_tokens() {
        assert_eq!(decode(DOT), ".");
        assert_eq!(decode(DOT_DOT), "..");
        assert_eq!(decode(EMPTY), "");
        assert_eq!(decode("a+b"), "a b");
        assert_eq!(decode("a%2Bb"), "a+b");
    }

    proptest! {
        #[test]
        fn encoded_segments_never_contain_separators(value in ".*") {
            let encoded = encode(&value);
            prop_assert!(!encoded.is_empty());
            prop_assert!(!encoded.contains('/'));
            prop_assert!(encoded != "." && encoded != "..");
        }

        #[test]
        fn encode_is_deterministic(value in ".*") {
            prop_assert_eq!(encode(&value), encode(&value));
        }

        #[test]
        fn encode_is_injective(a in ".{0,12}", b in ".{0,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(encode(&a), encode(&b));
        }

        #[test]
        fn decode_recovers_raw_value(value in ".*") {
            prop_assert_eq!(decode(&encode(&value)), value);
        }
    }
}
