//! Ascii85 codec for key vault entries.
//!
//! The vault stores encrypted private keys as text; base85 keeps the lines
//! ~20% shorter than base64. Plain Adobe alphabet (`!`..`u`), no `z`
//! shorthand and no frame marks.

use anyhow::{bail, Error};

/// Encode a binary blob as Ascii85.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() / 4 + 1) * 5);

    for group in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..group.len()].copy_from_slice(group);
        let mut acc = u32::from_be_bytes(word);

        let mut digits = [0u8; 5];
        for digit in digits.iter_mut().rev() {
            *digit = (acc % 85) as u8 + b'!';
            acc /= 85;
        }

        // a partial tail group of n bytes emits n+1 digits
        let keep = group.len() + 1;
        for &d in &digits[..keep] {
            out.push(d as char);
        }
    }

    out
}

/// Decode an Ascii85 string produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, Error> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 5 * 4 + 4);

    for group in bytes.chunks(5) {
        if group.len() == 1 {
            bail!("truncated base85 group");
        }
        let mut acc: u32 = 0;
        let mut digits = [84u8; 5]; // pad partial groups with 'u'
        for (i, &c) in group.iter().enumerate() {
            if !(b'!'..=b'u').contains(&c) {
                bail!("invalid base85 character {:?}", c as char);
            }
            digits[i] = c - b'!';
        }
        for &d in &digits {
            acc = acc
                .checked_mul(85)
                .and_then(|v| v.checked_add(d as u32))
                .ok_or_else(|| anyhow::format_err!("base85 group out of range"))?;
        }
        let word = acc.to_be_bytes();
        out.extend_from_slice(&word[..group.len() - 1]);
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        for len in 0..40 {
            let data: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37)).collect();
            let text = encode(&data);
            assert_eq!(decode(&text).unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn known_vector() {
        // "Man" in Adobe Ascii85
        assert_eq!(encode(b"Man"), "9jqo");
        assert_eq!(decode("9jqo").unwrap(), b"Man");
        assert_eq!(encode(b"sure"), "F*2M7");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("abc\u{7f}e").is_err());
        assert!(decode("v").is_err());
    }
}
