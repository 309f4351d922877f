//! Payload decoders.
//!
//! The wire format of each test's payload is the business of the
//! measurement software; here it is a replaceable black box behind
//! [`PayloadDecoder`]. The shipped decoders expect JSON: active-probe
//! reports as an array of per-target result objects, LPI reports as a
//! single counter object.

use nntsc_core::{LpiStats, Payload, StoreError};

pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Payload, StoreError>;
}

/// Active-probe test reports.
pub struct JsonTestDecoder;

impl PayloadDecoder for JsonTestDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Payload, StoreError> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| StoreError::Data(format!("undecodable test payload: {e}")))?;

        let results = match value {
            serde_json::Value::Array(entries) => entries,
            obj @ serde_json::Value::Object(_) => vec![obj],
            other => {
                return Err(StoreError::Data(format!(
                    "test payload is neither object nor array: {other}"
                )))
            }
        };
        Ok(Payload::TestResults(results))
    }
}

/// Passive-classification counter reports.
pub struct JsonLpiDecoder;

impl PayloadDecoder for JsonLpiDecoder {
    fn decode(&self, raw: &[u8]) -> Result<Payload, StoreError> {
        let stats: LpiStats = serde_json::from_slice(raw)
            .map_err(|e| StoreError::Data(format!("undecodable lpi payload: {e}")))?;
        Ok(Payload::Lpi(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_accepts_array_and_object() {
        let decoder = JsonTestDecoder;
        let Payload::TestResults(results) =
            decoder.decode(br#"[{"target": "a"}, {"target": "b"}]"#).unwrap()
        else {
            panic!("wrong payload family");
        };
        assert_eq!(results.len(), 2);

        let Payload::TestResults(results) = decoder.decode(br#"{"target": "a"}"#).unwrap() else {
            panic!("wrong payload family");
        };
        assert_eq!(results.len(), 1);

        assert!(decoder.decode(b"42").is_err());
        assert!(decoder.decode(b"not json").is_err());
    }

    #[test]
    fn lpi_decoder_parses_counters() {
        let decoder = JsonLpiDecoder;
        let raw = br#"{
            "monitor": "waikato", "user": "all", "dir": "in",
            "freq": 300, "metric": "bytes", "timestamp": 1000,
            "results": [["http", 1024], ["dns", 0]]
        }"#;
        let Payload::Lpi(stats) = decoder.decode(raw).unwrap() else {
            panic!("wrong payload family");
        };
        assert_eq!(stats.monitor, "waikato");
        assert_eq!(stats.results[0], ("http".to_string(), 1024));
    }
}
