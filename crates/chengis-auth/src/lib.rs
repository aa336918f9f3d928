//! SCM provider token resolution.
//!
//! §6: "Tokens are taken from `config.scm.<provider>.token` (or
//! `username`/`app-password` for Bitbucket)." This crate resolves the
//! per-provider credential the SCM status reporter and auto-merge engine
//! attach to their outbound HTTP calls, and masks tokens for safe display
//! in logs — the same masking shape `chengis-process::mask` applies to step
//! output, lifted to a single secret value.

use anyhow::{Result, anyhow};
use chengis_config::ScmConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScmCredential {
    /// Bearer/PAT token, used by GitHub, GitLab, and Gitea.
    Token(String),
    /// HTTP basic auth, used by Bitbucket (`username` + `app-password`).
    Basic { username: String, app_password: String },
}

impl ScmCredential {
    /// Render as an `Authorization` header value.
    pub fn authorization_header(&self) -> String {
        match self {
            ScmCredential::Token(token) => format!("Bearer {token}"),
            ScmCredential::Basic { username, app_password } => {
                let raw = format!("{username}:{app_password}");
                format!("Basic {}", base64_encode(raw.as_bytes()))
            }
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(n >> 6 & 0x3f) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[(n & 0x3f) as usize] as char } else { '=' });
    }
    out
}

/// Resolve the credential configured for `provider` (e.g. `"github"`,
/// `"bitbucket"`). Bitbucket resolves to `Basic`; every other provider
/// resolves to `Token`. Returns `None` if nothing is configured — callers
/// are expected to skip the outbound call rather than send an
/// unauthenticated request.
pub fn resolve_credential(scm: &ScmConfig, provider: &str) -> Option<ScmCredential> {
    let cfg = scm.provider(provider)?;
    if provider == "bitbucket" {
        return match (&cfg.username, &cfg.app_password) {
            (Some(username), Some(app_password)) => {
                Some(ScmCredential::Basic { username: username.clone(), app_password: app_password.clone() })
            }
            _ => None,
        };
    }
    cfg.token.clone().map(ScmCredential::Token)
}

pub fn require_credential(scm: &ScmConfig, provider: &str) -> Result<ScmCredential> {
    resolve_credential(scm, provider).ok_or_else(|| anyhow!("no credential configured for scm provider {provider}"))
}

/// Mask a token for safe display: first 4 and last 4 characters visible,
/// the rest replaced with `*`.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "*".repeat(token.len());
    }
    format!("{}****{}", &token[..4], &token[token.len() - 4..])
}
