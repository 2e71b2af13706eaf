//! Storage path expressions: `<TAG>` placeholders resolved against a base
//! path by a callback supplied at backend construction (spec §6
//! "Storage path expressions").

use camino::{Utf8Path, Utf8PathBuf};
use pg_util::CoreError;
use std::sync::Arc;

/// Maps a bracketed tag (without the angle brackets, e.g. `REPO:ARCHIVE`)
/// to the relative path it expands to. Returns `None` for unknown tags.
pub type PathExpressionCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// `<REPO:ARCHIVE>` → `<base>/archive/<stanza>`, `<REPO:BACKUP>` →
/// `<base>/backup/<stanza>`.
pub fn repo_path_expression(stanza: &str) -> PathExpressionCallback {
    let stanza = stanza.to_string();
    Arc::new(move |tag| match tag {
        "REPO:ARCHIVE" => Some(format!("archive/{stanza}")),
        "REPO:BACKUP" => Some(format!("backup/{stanza}")),
        _ => None,
    })
}

/// `<SPOOL:ARCHIVE_IN>` / `<SPOOL:ARCHIVE_OUT>` for the async WAL spool.
pub fn spool_path_expression() -> PathExpressionCallback {
    Arc::new(|tag| match tag {
        "SPOOL:ARCHIVE_IN" => Some("archive_in".to_string()),
        "SPOOL:ARCHIVE_OUT" => Some("archive_out".to_string()),
        _ => None,
    })
}

/// Resolve a backend-relative path. If `raw` starts with a `<TAG>`
/// placeholder, replace it with whatever the callback expands it to and
/// join with the rest; otherwise `raw` is used verbatim. Unknown tags are
/// an assertion failure, matching the source's `AssertError` on unresolved
/// expressions.
pub fn resolve(base: &Utf8Path, raw: &str, callback: &PathExpressionCallback) -> Result<Utf8PathBuf, CoreError> {
    if let Some(rest) = raw.strip_prefix('<') {
        if let Some((tag, remainder)) = rest.split_once('>') {
            let expansion = callback(tag)
                .ok_or_else(|| CoreError::Assert(format!("unknown storage path expression <{tag}>")))?;
            let remainder = remainder.strip_prefix('/').unwrap_or(remainder);
            return Ok(if remainder.is_empty() {
                base.join(expansion)
            } else {
                base.join(expansion).join(remainder)
            });
        }
    }
    Ok(base.join(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_repo_archive_tag() {
        let cb = repo_path_expression("demo");
        let resolved = resolve(Utf8Path::new("/repo"), "<REPO:ARCHIVE>/000000010000000000000001", &cb).unwrap();
        assert_eq!(resolved.as_str(), "/repo/archive/demo/000000010000000000000001");
    }

    #[test]
    fn resolves_spool_tag() {
        let cb = spool_path_expression();
        let resolved = resolve(Utf8Path::new("/spool"), "<SPOOL:ARCHIVE_OUT>/foo.ok", &cb).unwrap();
        assert_eq!(resolved.as_str(), "/spool/archive_out/foo.ok");
    }

    #[test]
    fn plain_path_passes_through() {
        let cb = repo_path_expression("demo");
        let resolved = resolve(Utf8Path::new("/repo"), "backup.info", &cb).unwrap();
        assert_eq!(resolved.as_str(), "/repo/backup.info");
    }

    #[test]
    fn unknown_tag_is_assert_error() {
        let cb = repo_path_expression("demo");
        assert!(resolve(Utf8Path::new("/repo"), "<BOGUS>/x", &cb).is_err());
    }
}
