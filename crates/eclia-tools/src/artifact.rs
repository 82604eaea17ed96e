//! Shared artifact-metadata helpers used by the `exec` and `send` tools and
//! by the gateway's artifacts endpoint (spec §3, §4.8).

use std::path::Path;

use eclia_core::{ArtifactKind, ArtifactMeta};
use sha2::{Digest, Sha256};

/// Guesses a MIME type from a file extension. Unknown extensions fall back
/// to `application/octet-stream`.
pub fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn mime_to_kind(mime: &str) -> ArtifactKind {
    if mime.starts_with("image/") {
        ArtifactKind::Image
    } else if mime == "application/json" {
        ArtifactKind::Json
    } else if mime.starts_with("text/") {
        ArtifactKind::Text
    } else {
        ArtifactKind::File
    }
}

/// Builds an `ArtifactMeta` for a file already written under
/// `<workspace_root>/.eclia/artifacts/...`.
pub fn build_artifact_meta(
    workspace_root: &Path,
    abs_path: &Path,
    bytes: &[u8],
) -> std::io::Result<ArtifactMeta> {
    let rel = abs_path
        .strip_prefix(workspace_root)
        .unwrap_or(abs_path)
        .to_string_lossy()
        .replace('\\', "/");
    let mime = guess_mime(abs_path).to_string();
    let kind = mime_to_kind(&mime);
    let uri = format!("eclia://artifact/{}", rel);
    let sha256 = format!("{:x}", Sha256::digest(bytes));

    Ok(ArtifactMeta {
        kind,
        path: rel,
        uri: uri.clone(),
        ref_: format!("<{}>", uri),
        bytes: bytes.len() as u64,
        mime,
        sha256: Some(sha256),
    })
}

/// Writes `bytes` into `dir` under a collision-safe filename derived from
/// `preferred_name` — appends a short random suffix if the name is taken
/// (spec §5 "filenames are collision-resolved by appending a random
/// suffix").
pub fn write_collision_safe(dir: &Path, preferred_name: &str, bytes: &[u8]) -> std::io::Result<std::path::PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut candidate = dir.join(preferred_name);
    if candidate.exists() {
        let stem = Path::new(preferred_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let ext = Path::new(preferred_name)
            .extension()
            .and_then(|s| s.to_str());
        let suffix: String = {
            use std::time::{SystemTime, UNIX_EPOCH};
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            format!("{:x}", nanos)
        };
        let name = match ext {
            Some(ext) => format!("{stem}-{suffix}.{ext}"),
            None => format!("{stem}-{suffix}"),
        };
        candidate = dir.join(name);
    }
    std::fs::write(&candidate, bytes)?;
    Ok(candidate)
}
