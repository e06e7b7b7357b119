use serde::{Deserialize, Serialize};

/// Lifecycle: New → Active (once) → Revoked (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    New,
    Active,
    Revoked,
}

/// Nonce range held by one device (`auth_id`) for one drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceSequence {
    pub drive_id: String,
    pub auth_id: String,
    /// Next nonce to hand out; set once by initialization
    #[serde(default, with = "b64_opt")]
    pub next_nonce: Option<Vec<u8>>,
    /// Upper bound of the range; may only decrease
    #[serde(default, with = "b64_opt")]
    pub max_nonce: Option<Vec<u8>>,
    pub status: SequenceStatus,
}

impl NonceSequence {
    pub fn new(drive_id: &str, auth_id: &str) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            auth_id: auth_id.to_string(),
            next_nonce: None,
            max_nonce: None,
            status: SequenceStatus::New,
        }
    }

    /// Store key, `drive_id:auth_id`
    pub fn key(&self) -> String {
        record_key(&self.drive_id, &self.auth_id)
    }

    /// Drive ids compare case-insensitively.
    pub fn matches_drive(&self, drive_id: &str) -> bool {
        self.drive_id.to_uppercase() == drive_id.to_uppercase()
    }

    /// New or Active
    pub fn is_open(&self) -> bool {
        matches!(self.status, SequenceStatus::New | SequenceStatus::Active)
    }
}

pub fn record_key(drive_id: &str, auth_id: &str) -> String {
    format!("{drive_id}:{auth_id}")
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD as B64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_some(&B64.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(de)?
            .map(|s| B64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
