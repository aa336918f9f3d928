//! Cache key template resolution: literal text plus `{{ hashFiles('glob') }}`
//! expressions resolved against the checked-out workspace.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Resolve every `{{ hashFiles('glob') }}` expression in `template`
/// against `workspace_root`, leaving literal text untouched.
pub fn resolve_key(template: &str, workspace_root: &Path) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        resolved.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").context("unterminated {{ ... }} expression in cache key template")?;
        let expr = after_open[..close].trim();
        resolved.push_str(&resolve_expression(expr, workspace_root)?);
        rest = &after_open[close + 2..];
    }
    resolved.push_str(rest);
    Ok(resolved)
}

fn resolve_expression(expr: &str, workspace_root: &Path) -> Result<String> {
    let inner = expr
        .strip_prefix("hashFiles(")
        .and_then(|s| s.strip_suffix(')'))
        .context("only hashFiles(...) expressions are supported in cache key templates")?;
    let pattern = inner.trim().trim_matches(|c| c == '\'' || c == '"');
    hash_files(pattern, workspace_root)
}

/// SHA-256 hex digest over the sorted, concatenated contents of every
/// workspace file matching `pattern`. No match resolves to the literal
/// string `missing`.
fn hash_files(pattern: &str, workspace_root: &Path) -> Result<String> {
    let matches = glob_walk(workspace_root, pattern)?;
    if matches.is_empty() {
        return Ok("missing".to_string());
    }

    let mut hasher = Sha256::new();
    for relative in &matches {
        let bytes = std::fs::read(workspace_root.join(relative))
            .with_context(|| format!("failed to read {relative} for hashFiles"))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Walk `root` recursively and return workspace-relative, `/`-separated
/// paths of every file matching `pattern`, sorted for determinism.
fn glob_walk(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let mut matches = Vec::new();
    walk(root, root, pattern, &mut matches)?;
    matches.sort();
    Ok(matches)
}

fn walk(root: &Path, dir: &Path, pattern: &str, matches: &mut Vec<String>) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Ok(()) };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, pattern, matches)?;
            continue;
        }
        let relative = relative_unix_path(root, &path);
        if glob_match(pattern, &relative) {
            matches.push(relative);
        }
    }
    Ok(())
}

fn relative_unix_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// `*` matches any run of non-`/` characters, `**` matches any run of
/// characters including `/`, `?` matches a single non-`/` character.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), pattern.get(1)) {
            (None, _) => text.is_empty(),
            (Some(b'*'), Some(b'*')) => {
                (0..=text.len()).any(|i| matches(&pattern[2..], &text[i..]))
            }
            (Some(b'*'), _) => (0..=text.len())
                .take_while(|&i| i == 0 || text[i - 1] != b'/')
                .any(|i| matches(&pattern[1..], &text[i..])),
            (Some(b'?'), _) => !text.is_empty() && text[0] != b'/' && matches(&pattern[1..], &text[1..]),
            (Some(&c), _) => !text.is_empty() && text[0] == c && matches(&pattern[1..], &text[1..]),
        }
    }
    matches(pattern.as_bytes(), text.as_bytes())
}
