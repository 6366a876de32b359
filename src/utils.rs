//! Encoding helpers for presentation formats.

use core::fmt;

//------------ base16 --------------------------------------------------------

pub mod base16 {
    use core::fmt;

    /// Writes `data` as upper case hex digits.
    pub fn display(data: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
        for ch in data {
            write!(f, "{:02X}", ch)?;
        }
        Ok(())
    }

    pub fn encode_string(data: &[u8]) -> String {
        data.iter().map(|ch| format!("{:02X}", ch)).collect()
    }
}

//------------ base32 --------------------------------------------------------

/// The base 32 encoding with extended hex alphabet of RFC 4648.
///
/// This is the encoding used for NSEC3 owner names. Since names are
/// lowercased, we encode to lower case. No padding is ever produced, NSEC3
/// hashes are a multiple of five octets long.
pub mod base32hex {
    const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut res = Vec::with_capacity(data.len().div_ceil(5) * 8);
        for chunk in data.chunks(5) {
            let mut buf = [0u8; 5];
            buf[..chunk.len()].copy_from_slice(chunk);
            let bits = buf.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
            let chars = (chunk.len() * 8).div_ceil(5);
            for i in 0..chars {
                let idx = (bits >> (35 - i * 5)) & 0x1F;
                res.push(ALPHABET[idx as usize]);
            }
        }
        res
    }

    /// Decodes case-insensitively. Returns `None` on illegal input.
    pub fn decode(data: &[u8]) -> Option<Vec<u8>> {
        let mut res = Vec::with_capacity(data.len() * 5 / 8);
        let mut acc = 0u64;
        let mut bits = 0;
        for &ch in data {
            let value = match ch.to_ascii_lowercase() {
                c @ b'0'..=b'9' => c - b'0',
                c @ b'a'..=b'v' => c - b'a' + 10,
                _ => return None,
            };
            acc = (acc << 5) | u64::from(value);
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                res.push((acc >> bits) as u8);
                acc &= (1 << bits) - 1;
            }
        }
        Some(res)
    }
}

//------------ base64 --------------------------------------------------------

pub mod base64 {
    use core::fmt;

    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub fn display(data: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
        for chunk in data.chunks(3) {
            let b = [
                chunk[0],
                chunk.get(1).copied().unwrap_or(0),
                chunk.get(2).copied().unwrap_or(0),
            ];
            let n = (u32::from(b[0]) << 16)
                | (u32::from(b[1]) << 8)
                | u32::from(b[2]);
            let out = [
                ALPHABET[(n >> 18) as usize & 0x3F],
                ALPHABET[(n >> 12) as usize & 0x3F],
                if chunk.len() > 1 {
                    ALPHABET[(n >> 6) as usize & 0x3F]
                } else {
                    b'='
                },
                if chunk.len() > 2 {
                    ALPHABET[n as usize & 0x3F]
                } else {
                    b'='
                },
            ];
            for ch in out {
                write!(f, "{}", ch as char)?;
            }
        }
        Ok(())
    }
}

//------------ DisplayWith ---------------------------------------------------

/// Adapts a formatting function for use with `{}`.
pub struct DisplayWith<'a>(
    pub &'a [u8],
    pub fn(&[u8], &mut fmt::Formatter) -> fmt::Result,
);

impl fmt::Display for DisplayWith<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.1)(self.0, f)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base32hex_round_trip() {
        // Test vectors from RFC 4648, section 10.
        assert_eq!(base32hex::encode(b"f"), b"co");
        assert_eq!(base32hex::encode(b"foob"), b"cpnmuog");
        assert_eq!(base32hex::encode(b"fooba"), b"cpnmuoj1");
        assert_eq!(base32hex::encode(b"foobar"), b"cpnmuoj1e8");
        assert_eq!(base32hex::decode(b"CPNMUOJ1").unwrap(), b"fooba");
        assert!(base32hex::decode(b"w").is_none());
    }

    #[test]
    fn base64_display() {
        let s = DisplayWith(b"foob", base64::display).to_string();
        assert_eq!(s, "Zm9vYg==");
        let s = DisplayWith(b"foobar", base64::display).to_string();
        assert_eq!(s, "Zm9vYmFy");
    }
}
