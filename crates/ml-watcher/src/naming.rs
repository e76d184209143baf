use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_K8S_NAME_LENGTH: usize = 63;
const JOB_PREFIX: &str = "job-";
const FALLBACK_DATASET: &str = "dataset";

/// Derives unique regeneration Job names.
///
/// Format: `job-{dataset}-{token}` where `token` is a UTC millisecond
/// timestamp forced to be strictly increasing across calls, so two names for
/// the same dataset never collide, even within one millisecond.
#[derive(Debug, Default)]
pub struct JobNamer {
    last_token: AtomicU64,
}

impl JobNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next uniqueness token, never lower than the wall clock in milliseconds.
    pub fn next_token(&self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let previous = self
            .last_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Name for the next regeneration run of `dataset_name`.
    pub fn next_name(&self, dataset_name: &str) -> String {
        Self::name(dataset_name, self.next_token())
    }

    /// Pure naming function: `job-{sanitized dataset}-{token}`, at most 63 characters.
    pub fn name(dataset_name: &str, token: u64) -> String {
        let token = token.to_string();
        let dataset = Self::sanitize(dataset_name);

        let available = MAX_K8S_NAME_LENGTH - JOB_PREFIX.len() - token.len() - 1;
        let dataset = Self::ensure_length(&dataset, available);

        format!("{JOB_PREFIX}{dataset}-{token}")
    }

    /// Lowercase alphanumerics, other runs folded into a single hyphen.
    fn sanitize(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut pending_hyphen = false;
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_hyphen && !out.is_empty() {
                    out.push('-');
                }
                pending_hyphen = false;
                out.push(c.to_ascii_lowercase());
            } else {
                pending_hyphen = true;
            }
        }

        if out.is_empty() {
            FALLBACK_DATASET.to_string()
        } else {
            out
        }
    }

    fn ensure_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }
        // keep a recognisable prefix, disambiguate with a hash of the full name
        let hash = Self::hash_string(name);
        let keep = limit.saturating_sub(hash.len() + 1);
        let prefix = name[..keep].trim_end_matches('-');
        format!("{prefix}-{hash}")
    }

    fn hash_string(s: &str) -> String {
        let digest = Sha256::digest(s.as_bytes());
        hex::encode(digest)[..8].to_string()
    }
}
