use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::types::{MediaAttachment, MediaItem, SessionKey};

const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;
const MAX_ATTACHMENTS: usize = 4;
const MEDIA_PREFIX: &str = "MEDIA: ";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("path escapes state directory: {0}")]
    PathEscapesStateDir(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rejects a `MEDIA:`/file-upload path that is absolute and outside `state_dir`, or
/// relative and containing a `..` component.
pub fn validate_contained_path(path: &str, state_dir: &Path) -> Result<PathBuf, MediaError> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        if candidate.starts_with(state_dir) {
            return Ok(candidate.to_path_buf());
        }
        return Err(MediaError::PathEscapesStateDir(path.to_owned()));
    }
    if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(MediaError::PathEscapesStateDir(path.to_owned()));
    }
    Ok(state_dir.join(candidate))
}

/// Persists file-media items to `state_dir/uploads/<sessionKey>/`, returning one
/// `File uploaded to: <path>` line per file to append to the outgoing message.
/// Also purges staged files older than 30 days.
pub fn stage_file_media(
    media: &[MediaItem],
    session_key: &SessionKey,
    state_dir: &Path,
) -> Result<Vec<String>, MediaError> {
    let upload_dir = state_dir.join("uploads").join(session_key);
    std::fs::create_dir_all(&upload_dir)?;
    purge_expired_uploads(&upload_dir);

    let mut lines = Vec::new();
    for item in media {
        if let MediaItem::File { path } = item {
            let resolved = validate_contained_path(path, state_dir)?;
            lines.push(format!("File uploaded to: {}", resolved.display()));
        }
    }
    Ok(lines)
}

fn purge_expired_uploads(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let Ok(age) = now.duration_since(modified) else { continue };
        if age > RETENTION {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

/// Reads `agents/main/sessions/sessions.json` to resolve `sessionKey` to its
/// transcript file, then returns the `text` field of the last `role: "assistant"`
/// line in that JSONL transcript. Absence of either file, or of any assistant
/// line, is not an error -- it just yields no `MEDIA:` scraping for this turn.
pub fn latest_assistant_transcript_line(session_key: &SessionKey, state_dir: &Path) -> Option<String> {
    let sessions_dir = state_dir.join("agents/main/sessions");
    let sessions_map: Value = serde_json::from_str(&std::fs::read_to_string(sessions_dir.join("sessions.json")).ok()?).ok()?;
    let session_file = sessions_map
        .get(format!("agent:main:{session_key}"))?
        .get("sessionFile")?
        .as_str()?;
    let transcript = std::fs::read_to_string(sessions_dir.join(session_file)).ok()?;
    transcript.lines().rev().find_map(|line| {
        let record: Value = serde_json::from_str(line).ok()?;
        if record.get("role")?.as_str()? != "assistant" {
            return None;
        }
        record.get("text")?.as_str().map(str::to_owned)
    })
}

/// Scrapes `MEDIA: <path>` lines out of the latest assistant message in a session
/// transcript and returns them base64-encoded with a sniffed content type, subject
/// to per-file and count caps.
pub fn collect_transcript_media(
    latest_assistant_message: &str,
    state_dir: &Path,
) -> Result<Vec<MediaAttachment>, MediaError> {
    let mut attachments = Vec::new();
    for line in latest_assistant_message.lines() {
        if attachments.len() >= MAX_ATTACHMENTS {
            break;
        }
        let Some(raw_path) = line.strip_prefix(MEDIA_PREFIX) else { continue };
        let raw_path = raw_path.trim();
        if raw_path.is_empty() {
            continue;
        }
        let resolved = match validate_contained_path(raw_path, state_dir) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let Ok(metadata) = std::fs::metadata(&resolved) else { continue };
        if metadata.len() > MAX_ATTACHMENT_BYTES {
            continue;
        }
        let Ok(bytes) = std::fs::read(&resolved) else { continue };
        attachments.push(MediaAttachment {
            path: raw_path.to_owned(),
            content_type: sniff_content_type(&resolved),
            base64_data: BASE64.encode(bytes),
        });
    }
    Ok(attachments)
}

fn sniff_content_type(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
    .to_owned()
}
