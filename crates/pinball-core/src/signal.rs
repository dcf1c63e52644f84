//! Signal token payloads.
//!
//! Signals are ordinary parked tokens consulted by workers and the
//! scheduler via plain queries; the master has no knowledge of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute key carrying the exit signal's generation cutoff.
pub const GENERATION_ATTR: &str = "generation";

/// Payload of a signal token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl SignalData {
    pub fn new() -> Self {
        Self::default()
    }

    /// An exit signal telling workers below `generation` to stop.
    pub fn exit(generation: u64) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(GENERATION_ATTR.to_string(), generation.to_string());
        Self { attributes }
    }

    /// The generation cutoff of an exit signal, if present and well-formed.
    pub fn generation(&self) -> Option<u64> {
        self.attributes.get(GENERATION_ATTR)?.parse().ok()
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_signal_generation() {
        let signal = SignalData::exit(7);
        let decoded = SignalData::decode(&signal.encode().unwrap()).unwrap();
        assert_eq!(decoded.generation(), Some(7));
    }

    #[test]
    fn test_missing_generation() {
        assert_eq!(SignalData::new().generation(), None);
    }
}
