//! Change marker fingerprints.
//!
//! A fingerprint is the SHA-256 of the canonical regeneration parameters.
//! Equal fingerprints mean "nothing to regenerate".

use crate::dataset::DatasetParams;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters kept when the fingerprint is used as a label value (labels cap at 63).
const LABEL_PREFIX_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of the parameters relevant to regeneration.
    pub fn of(params: &DatasetParams) -> Self {
        let mut hasher = Sha256::new();
        for (key, value) in params.canonical_pairs() {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a previously rendered fingerprint (e.g., from persisted state).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix suitable for a Kubernetes label value.
    pub fn label_value(&self) -> &str {
        self.0.get(..LABEL_PREFIX_LEN).unwrap_or(&self.0)
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
