/// Base64 helpers for PEM bodies and key material.
pub mod base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    #[inline]
    pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(data)
    }

    /// Decode ignoring ascii whitespace, as found in PEM bodies.
    #[inline]
    pub fn decode_multiline(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
        let stripped: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD.decode(stripped.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_encode_decode_roundtrip() {
        let data = b"girder wire bytes";
        assert_eq!(base64::decode(&base64::encode(data)).unwrap(), data);
    }

    #[test]
    fn test_decode_multiline() {
        let encoded = "Z2lyZGVyIHdp\ncmUgYnl0ZXM=\n";
        assert_eq!(base64::decode_multiline(encoded).unwrap(), b"girder wire bytes");
    }
}
