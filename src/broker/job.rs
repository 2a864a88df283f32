use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job payloads double as their identity; there is no separate job ID.
pub type Payload = Vec<u8>;

const PREVIEW_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(with = "base64_bytes")]
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(payload: impl Into<Payload>, created_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            created_at,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.payload
    }
}

/// Short, log-friendly rendering of a payload.
pub fn preview(payload: &[u8]) -> String {
    let shown = &payload[..payload.len().min(PREVIEW_BYTES)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if payload.len() > PREVIEW_BYTES {
        text.push_str("...");
    }
    text
}

/// Serde adapter carrying bytes as one standard base64 string instead of a
/// JSON array of numbers.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    /// Same encoding for an optional field.
    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", preview(&self.payload))
    }
}
