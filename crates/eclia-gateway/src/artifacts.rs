//! Read-only artifact serving (spec §4.8): `GET/HEAD /api/artifacts?path=`
//! streams a file out of `<workspace_root>/.eclia/artifacts/` by the
//! relative path an artifact ref points at, grounded on the teacher's
//! `artifact.rs` MIME table but wired into axum instead of the WebSocket
//! console.

use std::path::{Path, PathBuf};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use eclia_tools::artifact::guess_mime;

const ARTIFACTS_SUBDIR: &str = ".eclia/artifacts";

/// Resolves `rel_path` under the workspace's artifacts directory, rejecting
/// any path that escapes it via `..` components or an absolute path.
/// `rel_path` is repo-relative, i.e. it carries the `.eclia/artifacts/`
/// prefix the way an artifact ref's path does (spec.md's own
/// `?path=.eclia/artifacts/s1/c1/out.png` example) — strip that prefix
/// before joining it onto the artifacts root.
fn resolve_artifact_path(workspace_root: &Path, rel_path: &str) -> Option<PathBuf> {
    if rel_path.is_empty() {
        return None;
    }
    let stripped = rel_path.strip_prefix(ARTIFACTS_SUBDIR).unwrap_or(rel_path);
    let stripped = stripped.strip_prefix('/').unwrap_or(stripped);
    if stripped.is_empty() {
        return None;
    }
    let requested = Path::new(stripped);
    if requested.is_absolute() || requested.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return None;
    }

    let base = workspace_root.join(ARTIFACTS_SUBDIR);
    let candidate = base.join(requested);
    let canonical_base = base.canonicalize().ok()?;
    let canonical_candidate = candidate.canonicalize().ok()?;
    if !canonical_candidate.starts_with(&canonical_base) {
        return None;
    }
    Some(canonical_candidate)
}

pub fn serve_artifact(workspace_root: &Path, rel_path: &str) -> Response {
    let Some(abs_path) = resolve_artifact_path(workspace_root, rel_path) else {
        return (StatusCode::BAD_REQUEST, "invalid artifact path").into_response();
    };

    let bytes = match std::fs::read(&abs_path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, "artifact not found").into_response();
        }
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read artifact").into_response(),
    };

    let mime = guess_mime(&abs_path);
    let disposition = if mime.starts_with("image/") || mime == "text/html" || mime == "application/pdf" {
        "inline"
    } else {
        "attachment"
    };
    let filename = abs_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("{disposition}; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(ARTIFACTS_SUBDIR)).unwrap();
        assert!(resolve_artifact_path(dir.path(), "../../etc/passwd").is_none());
        assert!(resolve_artifact_path(dir.path(), "/etc/passwd").is_none());
    }

    #[test]
    fn resolves_existing_file_within_artifacts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join(ARTIFACTS_SUBDIR);
        std::fs::create_dir_all(artifacts.join("s1/call-1")).unwrap();
        std::fs::write(artifacts.join("s1/call-1/out.txt"), b"hello").unwrap();

        let resolved = resolve_artifact_path(dir.path(), "s1/call-1/out.txt");
        assert!(resolved.is_some());
    }

    #[test]
    fn resolves_path_prefixed_with_eclia_artifacts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join(ARTIFACTS_SUBDIR);
        std::fs::create_dir_all(artifacts.join("s1/c1")).unwrap();
        std::fs::write(artifacts.join("s1/c1/out.png"), b"fake-png").unwrap();

        let resolved = resolve_artifact_path(dir.path(), ".eclia/artifacts/s1/c1/out.png");
        assert!(resolved.is_some());
        assert_eq!(resolved.unwrap(), artifacts.join("s1/c1/out.png").canonicalize().unwrap());
    }
}
