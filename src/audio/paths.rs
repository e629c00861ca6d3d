//! XDG path helpers for clip files
//!
//! Clips are stored in: ~/.local/share/voice-ledger/recordings/

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Get the default recordings directory.
/// Returns: ~/.local/share/voice-ledger/recordings/
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voice-ledger")
        .join("recordings")
}

/// Replace anything that is not safe in a file name.
fn sanitize_session_name(session_name: &str) -> String {
    let cleaned: String = session_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

/// Generate the file path for a new clip, creating `dir` if needed.
/// Format: <session>_<YYYYMMDD_HHMMSS>.wav, with `_N` appended on collision.
pub fn generate_clip_path(
    dir: &Path,
    session_name: &str,
    started_at: DateTime<Utc>,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let stem = format!(
        "{}_{}",
        sanitize_session_name(session_name),
        started_at.format("%Y%m%d_%H%M%S")
    );

    let mut candidate = dir.join(format!("{}.wav", stem));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.wav", stem, n));
        n += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_clip_path() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = generate_clip_path(dir.path(), "Session1", at).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "Session1_20240309_140507.wav"
        );
    }

    #[test]
    fn test_collisions_get_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let first = generate_clip_path(dir.path(), "A", at).unwrap();
        fs::write(&first, b"x").unwrap();
        let second = generate_clip_path(dir.path(), "A", at).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.wav"));
    }

    #[test]
    fn test_session_name_is_sanitized() {
        assert_eq!(sanitize_session_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_session_name("  "), "session");
        assert_eq!(sanitize_session_name("Board meeting 2"), "Board_meeting_2");
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let path = generate_clip_path(&nested, "x", Utc::now()).unwrap();
        assert!(nested.is_dir());
        assert!(path.starts_with(&nested));
    }

    #[test]
    fn test_default_dir_contains_expected_path() {
        let dir = default_recordings_dir();
        let path_str = dir.to_string_lossy();
        assert!(path_str.contains("voice-ledger"));
        assert!(path_str.contains("recordings"));
    }
}
