//! Wire encodings shared across crates
//!
//! Signatures and public keys travel as base64 (standard alphabet, padding
//! retained); UUIDs as lowercase hyphenated strings; node IDs as hex.

/// Serde adapter: `Vec<u8>` as standard padded base64.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Encode bytes as standard padded base64 (non-serde call sites).
pub fn to_b64(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

/// Decode standard padded base64.
pub fn from_b64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "b64")]
        data: Vec<u8>,
    }

    #[test]
    fn test_b64_round_trip() {
        let w = Wrapper {
            data: vec![0, 1, 2, 255],
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"data":"AAEC/w=="}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_padding_retained() {
        assert_eq!(to_b64(b"ab"), "YWI=");
        assert_eq!(from_b64("YWI=").unwrap(), b"ab");
    }
}
