//! Secret masking applied to every process output line before it is
//! aggregated or handed to a callback.
//!
//! This runs *inside* the process sub-executor rather than as a later
//! filtering pass, so a secret can never reach a log sink, event, or cache
//! entry in unmasked form — there is no code path between a child
//! process's pipe and the rest of the system that skips it.

const REDACTED: &str = "****";
const MIN_SECRET_LEN: usize = 4;

/// Masks a fixed set of literal secret values out of text.
///
/// Values shorter than [`MIN_SECRET_LEN`] are ignored: masking something
/// like `"ok"` would redact far more ordinary output than it protects.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Vec<String>,
}

impl SecretMasker {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Mask longest-first so a secret that is a substring of a longer
        // one (e.g. an API key prefix) doesn't get partially masked first.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Return `line` with every configured secret replaced by `****`.
    pub fn mask(&self, line: &str) -> String {
        if self.secrets.is_empty() {
            return line.to_string();
        }
        let mut masked = line.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), REDACTED);
            }
        }
        masked
    }
}
