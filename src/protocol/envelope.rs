use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{FleetError, Result};

/// Message kinds carried on the worker channel.
///
/// `register`, `heartbeat` and `status_report` flow worker->master and expect
/// no reply. `command`, `config` and `wake_on_lan` flow master->worker.
/// The maintenance kinds (`log_files`, `cleanup_cache`, `scan_orphans`,
/// `delete_orphans`) are call/reply: the request carries a correlation id and
/// the worker answers with a `response` envelope echoing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Register,
    Heartbeat,
    Command,
    Response,
    Config,
    StatusReport,
    LogFiles,
    CleanupCache,
    ScanOrphans,
    DeleteOrphans,
    WakeOnLan,
}

impl EnvelopeKind {
    /// Whether a request of this kind expects a correlated `response`.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            EnvelopeKind::LogFiles
                | EnvelopeKind::CleanupCache
                | EnvelopeKind::ScanOrphans
                | EnvelopeKind::DeleteOrphans
        )
    }

    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::Register,
        EnvelopeKind::Heartbeat,
        EnvelopeKind::Command,
        EnvelopeKind::Response,
        EnvelopeKind::Config,
        EnvelopeKind::StatusReport,
        EnvelopeKind::LogFiles,
        EnvelopeKind::CleanupCache,
        EnvelopeKind::ScanOrphans,
        EnvelopeKind::DeleteOrphans,
        EnvelopeKind::WakeOnLan,
    ];
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde gives us the canonical snake_case name
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// The unified message wrapper exchanged over the worker channel.
///
/// `payload` is kept as raw JSON so this layer never re-serializes (and so
/// round-trips are byte-exact); the schema is selected by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(rename = "id", default)]
    pub id: String,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Build an envelope from a serializable payload.
    ///
    /// Serialization of our own payload types is infallible for valid
    /// inputs; a failure here is a caller bug, surfaced as Json.
    pub fn new<T: Serialize>(kind: EnvelopeKind, id: impl Into<String>, payload: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            kind,
            id: id.into(),
            payload: raw,
        })
    }

    /// Fire-and-forget envelope with an empty correlation id.
    pub fn oneway<T: Serialize>(kind: EnvelopeKind, payload: &T) -> Result<Self> {
        Self::new(kind, "", payload)
    }

    /// A `response` envelope correlated with the given request id.
    pub fn response<T: Serialize>(request_id: impl Into<String>, payload: &T) -> Result<Self> {
        Self::new(EnvelopeKind::Response, request_id, payload)
    }

    /// Serialize the whole envelope for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse an envelope from wire bytes.
    ///
    /// A decode failure is non-fatal to the connection: callers log it and
    /// keep reading (framing-level corruption is detected one layer down).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| FleetError::MalformedEnvelope(e.to_string()))
    }

    /// Deserialize the payload into the schema selected by `kind`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.payload.get())
            .map_err(|e| FleetError::MalformedEnvelope(format!("{} payload: {}", self.kind, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_every_kind() {
        for kind in EnvelopeKind::ALL {
            let env = Envelope::new(kind, "req-42", &json!({"a": 1, "b": "x"})).unwrap();
            let bytes = env.encode().unwrap();
            let back = Envelope::decode(&bytes).unwrap();
            assert_eq!(back.kind, kind);
            assert_eq!(back.id, "req-42");
            assert_eq!(back.payload.get(), env.payload.get());
        }
    }

    #[test]
    fn payload_bytes_are_not_reordered() {
        // RawValue must carry the payload through untouched, field order included.
        let env = Envelope::new(EnvelopeKind::Command, "", &json!({"z": 1, "a": 2})).unwrap();
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back.payload.get(), env.payload.get());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json at all"),
            Err(FleetError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"type":"no_such_kind","id":"","payload":{}}"#),
            Err(FleetError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn missing_id_defaults_to_empty() {
        let back = Envelope::decode(br#"{"type":"heartbeat","payload":{}}"#).unwrap();
        assert_eq!(back.kind, EnvelopeKind::Heartbeat);
        assert!(back.id.is_empty());
    }

    #[test]
    fn reply_expectation_matches_catalogue() {
        assert!(EnvelopeKind::CleanupCache.expects_reply());
        assert!(EnvelopeKind::ScanOrphans.expects_reply());
        assert!(!EnvelopeKind::Heartbeat.expects_reply());
        assert!(!EnvelopeKind::WakeOnLan.expects_reply());
    }
}
