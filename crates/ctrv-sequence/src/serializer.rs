//! Sequence store encoding

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ctrv_core::{CtrvResult, SequenceError};

use crate::record::NonceSequence;

/// Records keyed by `drive_id:auth_id`
pub type SequenceMap = BTreeMap<String, NonceSequence>;

pub trait SequenceSerializer: Send + Sync {
    fn serialize(&self, sequences: &SequenceMap) -> CtrvResult<String>;

    /// Empty input is an empty record set.
    fn deserialize(&self, contents: &str) -> CtrvResult<SequenceMap>;
}

const WARNING: &str = "Do not edit or copy this file: doing so can make a device reuse nonces";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SequenceDocument {
    #[serde(default)]
    warning: String,
    #[serde(default)]
    drives: Vec<NonceSequence>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSequenceSerializer;

impl SequenceSerializer for JsonSequenceSerializer {
    fn serialize(&self, sequences: &SequenceMap) -> CtrvResult<String> {
        let doc = SequenceDocument {
            warning: WARNING.to_string(),
            drives: sequences.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&doc)
            .map_err(|e| SequenceError::Store(format!("serializing sequences: {e}")).into())
    }

    fn deserialize(&self, contents: &str) -> CtrvResult<SequenceMap> {
        if contents.trim().is_empty() {
            return Ok(SequenceMap::new());
        }
        let doc: SequenceDocument = serde_json::from_str(contents)
            .map_err(|e| SequenceError::Store(format!("parsing sequences: {e}")))?;
        let mut sequences = SequenceMap::new();
        for seq in doc.drives {
            let key = seq.key();
            if sequences.insert(key.clone(), seq).is_some() {
                return Err(
                    SequenceError::Store(format!("duplicate sequence record {key}")).into(),
                );
            }
        }
        Ok(sequences)
    }
}
