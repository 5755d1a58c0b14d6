//! Percent-encoding for external file keys
//!
//! External big files are addressed as `_bigFiles/<container_id>/<name>`
//! inside the archive bucket. File names are arbitrary UTF-8, so the name
//! component is percent-encoded: RFC 3986 unreserved characters
//! (`A-Z a-z 0-9 - . _ ~`) pass through, everything else becomes `%XX` per
//! UTF-8 byte.

/// Percent-encode a file name for use as an object key component.
pub fn percent_encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreserved_passes_through() {
        assert_eq!(
            percent_encode_name("IMG_20250115_1A2B3C4D5E6F_01.jpg"),
            "IMG_20250115_1A2B3C4D5E6F_01.jpg"
        );
        assert_eq!(percent_encode_name("a-b.c_d~e"), "a-b.c_d~e");
    }

    #[test]
    fn test_reserved_is_encoded() {
        assert_eq!(percent_encode_name("a b"), "a%20b");
        assert_eq!(percent_encode_name("a+b&c"), "a%2Bb%26c");
        assert_eq!(percent_encode_name("100%"), "100%25");
    }

    #[test]
    fn test_utf8_is_encoded_per_byte() {
        assert_eq!(percent_encode_name("ż"), "%C5%BC");
        assert_eq!(percent_encode_name("京"), "%E4%BA%AC");
    }
}
