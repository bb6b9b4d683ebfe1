//! Wire codecs.
//!
//! Messages are plain serde types. A codec turns them into bytes:
//! - **Bincode**: compact binary, the default
//! - **Json**: human-readable, handy when sniffing traffic
//!
//! Both carry the same logical fields, so a node can decode either one by
//! looking at the first byte of a frame.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty frame")]
    Empty,

    #[error("Unknown codec: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Serialization backend for envelopes and message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Bincode,
    Json,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Bincode => Ok(bincode::serialize(value)?),
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Bincode => Ok(bincode::deserialize(data)?),
            Codec::Json => Ok(serde_json::from_slice(data)?),
        }
    }

    /// Guess the codec of a frame from its first byte.
    ///
    /// JSON frames start with `{`. Bincode envelopes start with the
    /// protocol version byte, which is never `{`.
    pub fn detect(data: &[u8]) -> Option<Codec> {
        match data.first() {
            Some(b'{') => Some(Codec::Json),
            Some(_) => Some(Codec::Bincode),
            None => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Bincode => "bincode",
            Codec::Json => "json",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bincode" => Ok(Codec::Bincode),
            "json" => Ok(Codec::Json),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        version: u8,
        name: String,
    }

    fn sample() -> Sample {
        Sample {
            version: 1,
            name: "node".into(),
        }
    }

    // ==================== Detection ====================

    #[test]
    fn test_detect_json() {
        let data = Codec::Json.encode(&sample()).unwrap();
        assert_eq!(Codec::detect(&data), Some(Codec::Json));
    }

    #[test]
    fn test_detect_bincode() {
        let data = Codec::Bincode.encode(&sample()).unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(Codec::detect(&data), Some(Codec::Bincode));
    }

    #[test]
    fn test_detect_empty() {
        assert_eq!(Codec::detect(&[]), None);
    }

    // ==================== Encode / decode ====================

    #[test]
    fn test_both_codecs_decode_their_own_output() {
        for codec in [Codec::Bincode, Codec::Json] {
            let data = codec.encode(&sample()).unwrap();
            let decoded: Sample = codec.decode(&data).unwrap();
            assert_eq!(decoded, sample(), "codec {}", codec);
        }
    }

    #[test]
    fn test_truncated_bincode_is_an_error() {
        let data = Codec::Bincode.encode(&sample()).unwrap();
        let result: Result<Sample> = Codec::Bincode.decode(&data[..3]);
        assert!(matches!(result, Err(CodecError::Bincode(_))));
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!("bincode".parse::<Codec>().unwrap(), Codec::Bincode);
        assert_eq!(" JSON ".parse::<Codec>().unwrap(), Codec::Json);
        assert!(matches!(
            "protobuf".parse::<Codec>(),
            Err(CodecError::Unknown(name)) if name == "protobuf"
        ));
    }
}
