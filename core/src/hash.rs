use md5::{Digest as _, Md5};

/// A hash digest. Equality and ordering are byte-wise.
pub type Digest = [u8; 16];

/// Hashes a preimage with MD5.
#[inline]
pub fn md5(data: &[u8]) -> Digest {
    Md5::digest(data).into()
}

/// Parses the 32-lowercase-hex text encoding of a digest.
/// Uppercase digits are accepted on input.
pub fn parse_hex_digest(s: &str) -> Option<Digest> {
    if s.len() != 32 || !s.is_ascii() {
        return None;
    }

    let mut digest = Digest::default();
    for (i, byte) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = (byte[0] as char).to_digit(16)?;
        let lo = (byte[1] as char).to_digit(16)?;
        digest[i] = (hi as u8) << 4 | lo as u8;
    }

    Some(digest)
}

/// Formats a digest as 32 lowercase hex characters.
pub fn format_hex_digest(digest: &Digest) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(32);
    for byte in digest {
        write!(s, "{byte:02x}").unwrap();
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_vectors() {
        // RFC 1321 appendix A.5
        assert_eq!(
            parse_hex_digest("d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            md5(b"")
        );
        assert_eq!(
            parse_hex_digest("0cc175b9c0f1b6a831c399e269772661").unwrap(),
            md5(b"a")
        );
        assert_eq!(
            parse_hex_digest("f96b697d7cb7938d525a2f31aaf161d0").unwrap(),
            md5(b"message digest")
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = md5(b"rtcrack");
        assert_eq!(Some(digest), parse_hex_digest(&format_hex_digest(&digest)));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(None, parse_hex_digest("d41d8cd98f00b204e9800998ecf8427"));
        assert_eq!(None, parse_hex_digest("g41d8cd98f00b204e9800998ecf8427e"));
        assert!(parse_hex_digest("D41D8CD98F00B204E9800998ECF8427E").is_some());
    }
}
