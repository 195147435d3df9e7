//! BLAKE3 based content identifiers and their text forms.

use blake3::Hasher;

use crate::error::{Error, Result};

/// A 256-bit content digest.
pub type Digest = [u8; 32];

/// The key used when a blob is posted without a salt.
pub const NO_SALT: Digest = [0u8; 32];

/// Length of a digest rendered in the order-preserving base-64 alphabet.
pub const TEXT_LEN: usize = 43;

const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Compute the content digest of `bytes`, keyed by `salt` (or the zero key).
pub fn compute(salt: Option<&Digest>, bytes: &[u8]) -> Digest {
    let mut hasher = Hasher::new_keyed(salt.unwrap_or(&NO_SALT));
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}

/// Render a digest in the order-preserving base-64 alphabet, without padding.
pub fn to_text(cid: &Digest) -> String {
    let mut out = String::with_capacity(TEXT_LEN);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for byte in cid {
        acc = (acc << 8) | u32::from(*byte);
        bits += 8;
        while bits >= 6 {
            bits -= 6;
            out.push(ALPHABET[((acc >> bits) & 0x3f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (6 - bits)) & 0x3f) as usize] as char);
    }
    out
}

/// Parse the text form produced by [`to_text`].
pub fn from_text(s: &str) -> Result<Digest> {
    if s.len() != TEXT_LEN {
        return Err(Error::Malformed(format!(
            "reference must be {TEXT_LEN} characters, got length {}",
            s.len()
        )));
    }
    let mut out = [0u8; 32];
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    let mut pos = 0usize;
    for ch in s.bytes() {
        let sextet = text_value(ch)
            .ok_or_else(|| Error::Malformed(format!("invalid reference character `{}`", ch as char)))?;
        acc = (acc << 6) | u32::from(sextet);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            if pos < out.len() {
                out[pos] = (acc >> bits) as u8;
            }
            pos += 1;
        }
        acc &= (1 << bits) - 1;
    }
    if acc != 0 {
        return Err(Error::Malformed("reference has non-zero trailing bits".into()));
    }
    Ok(out)
}

/// Render a digest (or any blob) as lowercase hexadecimal for human output.
pub fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut buf = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        buf.push(HEX[(byte >> 4) as usize] as char);
        buf.push(HEX[(byte & 0x0f) as usize] as char);
    }
    buf
}

/// Parse lowercase or uppercase hexadecimal into bytes.
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Malformed(format!(
            "hex input must have even length, got {}",
            s.len()
        )));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_value(pair[0])
            .ok_or_else(|| Error::Malformed(format!("invalid hex digit `{}`", pair[0] as char)))?;
        let lo = hex_value(pair[1])
            .ok_or_else(|| Error::Malformed(format!("invalid hex digit `{}`", pair[1] as char)))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

/// Convert a raw slice into a digest, validating the length.
pub fn from_slice(data: &[u8]) -> Result<Digest> {
    if data.len() != 32 {
        return Err(Error::Size(format!(
            "digest must be exactly 32 bytes, got {}",
            data.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(data);
    Ok(out)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn text_value(ch: u8) -> Option<u8> {
    match ch {
        b'-' => Some(0),
        b'0'..=b'9' => Some(ch - b'0' + 1),
        b'A'..=b'Z' => Some(ch - b'A' + 11),
        b'_' => Some(37),
        b'a'..=b'z' => Some(ch - b'a' + 38),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsalted_hash_uses_zero_key() {
        let data = b"mycelium";
        let expected = *blake3::keyed_hash(&[0u8; 32], data).as_bytes();
        assert_eq!(compute(None, data), expected);
        assert_ne!(compute(Some(&[7u8; 32]), data), expected);
    }

    #[test]
    fn text_roundtrip() -> Result<()> {
        let cid = compute(None, b"roundtrip");
        let text = to_text(&cid);
        assert_eq!(text.len(), TEXT_LEN);
        assert_eq!(from_text(&text)?, cid);
        Ok(())
    }

    #[test]
    fn text_preserves_order() {
        let mut digests: Vec<Digest> = (0u8..40)
            .map(|i| compute(None, &[i, i.wrapping_mul(31)]))
            .collect();
        digests.push([0u8; 32]);
        digests.push([0xff; 32]);
        let mut by_bytes = digests.clone();
        by_bytes.sort();
        let mut by_text = digests;
        by_text.sort_by_key(to_text);
        assert_eq!(by_bytes, by_text);
    }

    #[test]
    fn text_extremes() {
        assert_eq!(to_text(&[0u8; 32]), "-".repeat(TEXT_LEN));
        let top = to_text(&[0xff; 32]);
        assert!(top.starts_with("zzzz"));
        assert!(top.ends_with('w'));
    }

    #[test]
    fn from_text_rejects_bad_input() {
        assert!(from_text("short").is_err());
        assert!(from_text(&"+".repeat(TEXT_LEN)).is_err());
        let mut dirty = "-".repeat(TEXT_LEN - 1);
        dirty.push('0');
        assert!(from_text(&dirty).is_err());
    }

    #[test]
    fn hex_and_slice() -> Result<()> {
        let bytes = from_hex("00ff7a")?;
        assert_eq!(bytes, vec![0x00, 0xff, 0x7a]);
        assert_eq!(to_hex(&bytes), "00ff7a");
        assert!(from_hex("abc").is_err());
        assert!(from_slice(&[0u8; 31]).is_err());
        assert!(from_slice(&[0u8; 32]).is_ok());
        Ok(())
    }
}
