//! Small shared helpers: blocking git2 work and ref-safe naming.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a blocking closure (git2 calls) on tokio's blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Make a string usable as a single ref or directory component.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `-`, runs of `-` collapse,
/// and leading dots/dashes are stripped so git accepts the result.
pub fn sanitize_ref_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out
        .trim_start_matches(['.', '-'])
        .trim_end_matches(['.', '-'])
        .replace("..", ".");
    if trimmed.is_empty() {
        "task".to_string()
    } else if let Some(stripped) = trimmed.strip_suffix(".lock") {
        format!("{}-lock", stripped)
    } else {
        trimmed
    }
}
