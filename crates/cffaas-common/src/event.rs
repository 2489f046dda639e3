//! Envelope types for the rendezvous protocol.
//!
//! A [`Request`] is the snapshot of an inbound HTTP request that the relayer
//! parks; a worker fetches it as JSON, runs the user command and posts a
//! [`Response`] back to the same token URL. A [`Work`] item is what the
//! worker pool hands to a polling worker: the token URL to fetch, the command
//! to run and the app whose package supplies the working directory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Snapshot of a parked inbound HTTP request.
///
/// Body bytes travel as standard base64 so the envelope stays valid JSON for
/// workers in any language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub url_variables: HashMap<String, String>,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Response envelope a worker posts back to a token URL.
///
/// Only `status_code` is required on the wire; `{"status_code":500}` is the
/// complete envelope a worker posts when the user command fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// A unit of work handed to a polling worker.
///
/// Created per inbound request, consumed exactly once, discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub href: String,
    pub command: String,
    pub app_name: String,
}

/// Serde adapter carrying `Vec<u8>` as a standard-base64 JSON string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
