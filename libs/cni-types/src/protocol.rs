//! Control protocol between the CNI shim and the node CNI server.
//!
//! The shim forwards its whole invocation: process environment (where the
//! container runtime puts `CNI_COMMAND`, `CNI_CONTAINERID`, ...) and the raw
//! stdin configuration. The server answers with a [`CniResponse`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::CniResult;

/// One forwarded CNI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniRequest {
    /// Invocation environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Raw stdin configuration, base64 on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<u8>,
}

impl CniRequest {
    /// Build a request from environment entries and stdin bytes.
    pub fn new<I, S>(env: I, config: Vec<u8>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            env: env_map(env),
            config,
        }
    }
}

/// Server reply to a successful request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResponse {
    /// Present for ADD; absent for DEL and CHECK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CniResult>,
}

/// Turn `KEY=VALUE` entries into a map.
///
/// The key is trimmed; the value is everything after the first `=`. Entries
/// without `=` or with an empty key are dropped.
pub fn env_map<I, S>(entries: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let (key, value) = entry.as_ref().split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_map_skips_malformed() {
        let map = env_map(["A=1", "B=2=3", "NOVALUE"]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["A"], "1");
        assert_eq!(map["B"], "2=3");
        assert!(!map.contains_key("NOVALUE"));
    }

    #[test]
    fn test_env_map_trims_keys_and_drops_empty() {
        let map = env_map([" CNI_IFNAME =eth0", "=orphan", "EMPTY="]);
        assert_eq!(map["CNI_IFNAME"], "eth0");
        assert_eq!(map["EMPTY"], "");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_config_is_base64_on_the_wire() {
        let request = CniRequest::new(["CNI_COMMAND=ADD"], br#"{"cniVersion":"0.3.1"}"#.to_vec());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["config"], "eyJjbmlWZXJzaW9uIjoiMC4zLjEifQ==");
        assert_eq!(json["env"]["CNI_COMMAND"], "ADD");

        let decoded: CniRequest = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_null_config_decodes_empty() {
        let decoded: CniRequest = serde_json::from_str(r#"{"env":{},"config":null}"#).unwrap();
        assert!(decoded.config.is_empty());
    }

    #[test]
    fn test_response_without_result() {
        let json = serde_json::to_string(&CniResponse::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
