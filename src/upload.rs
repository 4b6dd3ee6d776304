//! File upload handling for the data WebSocket
//!
//! `FILE_UPLOAD_START:<rel>:<size>` opens a write handle under the upload
//! root; 0x01 binary frames append; END closes and ERROR deletes the
//! partial file. Target paths are sanitized and canonicalized so nothing
//! escapes the root.

use log::{error, info, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub upload_dir: Option<PathBuf>,
    pub allow_upload: bool,
}

impl UploadSettings {
    pub fn new(allow_upload: bool, raw_dir: &str) -> Self {
        let upload_dir = if allow_upload {
            resolve_upload_dir(raw_dir)
        } else {
            None
        };
        Self {
            upload_dir,
            allow_upload,
        }
    }
}

/// Per-session upload state machine.
pub struct UploadHandler {
    settings: UploadSettings,
    active_path: Option<PathBuf>,
    active_file: Option<File>,
    expected_size: Option<u64>,
    written_size: u64,
}

impl UploadHandler {
    pub fn new(settings: UploadSettings) -> Self {
        Self {
            settings,
            active_path: None,
            active_file: None,
            expected_size: None,
            written_size: 0,
        }
    }

    pub fn start(&mut self, rel_path: &str, size: u64) {
        if !self.settings.allow_upload || self.settings.upload_dir.is_none() {
            warn!("File upload requested but uploads are disabled");
            return;
        }
        if self.active_file.is_some() {
            warn!("Closing previous upload before starting new one");
            self.finish();
        }
        if let Err(err) = self.open_target(rel_path, size) {
            error!("File upload start failed: {}", err);
            self.abort();
        }
    }

    fn open_target(&mut self, rel_path: &str, size: u64) -> Result<(), String> {
        let upload_root = self
            .settings
            .upload_dir
            .as_ref()
            .ok_or_else(|| "Upload directory is not configured".to_string())?
            .clone();

        if size == 0 {
            return Err("Invalid file size".to_string());
        }
        if size > MAX_UPLOAD_BYTES {
            return Err(format!("Upload exceeds size limit ({} bytes)", MAX_UPLOAD_BYTES));
        }

        let safe_rel = sanitize_relative_path(rel_path)
            .ok_or_else(|| format!("Invalid relative path: {}", rel_path))?;

        let target_path = upload_root.join(&safe_rel);
        let target_dir = target_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| upload_root.clone());

        if !target_dir.starts_with(&upload_root) {
            return Err(format!(
                "Path escape attempt detected: {:?} is outside {:?}",
                target_path, upload_root
            ));
        }
        if target_dir != upload_root {
            fs::create_dir_all(&target_dir)
                .map_err(|err| format!("Failed to create upload directory {:?}: {}", target_dir, err))?;
        }

        let root_canon = fs::canonicalize(&upload_root)
            .map_err(|err| format!("Failed to canonicalize upload root {:?}: {}", upload_root, err))?;
        let target_dir_canon = fs::canonicalize(&target_dir)
            .map_err(|err| format!("Failed to canonicalize upload target {:?}: {}", target_dir, err))?;
        if !target_dir_canon.starts_with(&root_canon) {
            return Err(format!(
                "Path escape attempt detected via symlink: {:?} is outside {:?}",
                target_dir_canon, root_canon
            ));
        }
        if let Ok(meta) = fs::symlink_metadata(&target_path) {
            if meta.file_type().is_symlink() {
                return Err(format!("Refusing to follow symlink target {:?}", target_path));
            }
        }

        let file = File::create(&target_path)
            .map_err(|err| format!("Failed to create upload file {:?}: {}", target_path, err))?;
        self.active_file = Some(file);
        self.active_path = Some(target_path.clone());
        self.expected_size = Some(size);
        self.written_size = 0;
        info!("Upload started: {:?} (size: {})", target_path, size);
        Ok(())
    }

    /// Append one 0x01 chunk payload (tag already stripped).
    pub fn write_chunk(&mut self, payload: &[u8]) {
        let Some(file) = self.active_file.as_mut() else {
            warn!("Received file data with no open upload");
            return;
        };
        if let Some(expected) = self.expected_size {
            let next = self.written_size.saturating_add(payload.len() as u64);
            if next > expected {
                error!(
                    "Upload exceeded declared size (expected {}, got {})",
                    expected, next
                );
                self.abort();
                return;
            }
        }
        if let Err(err) = file.write_all(payload) {
            error!(
                "File write error for {:?}: {}",
                self.active_path.as_deref(),
                err
            );
            self.abort();
            return;
        }
        self.written_size = self.written_size.saturating_add(payload.len() as u64);
    }

    pub fn finish(&mut self) {
        if let Some(mut file) = self.active_file.take() {
            if let Err(err) = file.flush() {
                warn!("Failed to flush upload file: {}", err);
            }
        }
        if let Some(path) = self.active_path.take() {
            match self.expected_size {
                Some(expected) if self.written_size != expected => {
                    warn!(
                        "Upload size mismatch for {:?}: expected {}, got {}",
                        path, expected, self.written_size
                    );
                    let _ = fs::remove_file(&path);
                }
                _ => info!("Upload finished: {:?}", path),
            }
        }
        self.expected_size = None;
        self.written_size = 0;
    }

    /// Close and delete the partial file.
    pub fn abort(&mut self) {
        if let Some(mut file) = self.active_file.take() {
            let _ = file.flush();
        }
        if let Some(path) = self.active_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                warn!("Failed to remove incomplete upload {:?}: {}", path, err);
            } else {
                info!("Purged incomplete upload {:?}", path);
            }
        }
        self.expected_size = None;
        self.written_size = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active_file.is_some()
    }
}

impl Drop for UploadHandler {
    fn drop(&mut self) {
        if self.is_active() {
            self.abort();
        }
    }
}

fn resolve_upload_dir(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "/sys" || trimmed == "/proc" || trimmed == "/dev" {
        warn!("Refusing to use upload directory {}", trimmed);
        return None;
    }
    let expanded = if let Some(suffix) = trimmed.strip_prefix("~/") {
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(suffix),
            Err(_) => PathBuf::from(trimmed),
        }
    } else {
        PathBuf::from(trimmed)
    };

    if let Err(err) = fs::create_dir_all(&expanded) {
        warn!("Could not create upload directory {:?}: {}", expanded, err);
        return None;
    }
    Some(expanded)
}

/// Reduce a client-supplied relative path to plain normal components.
/// Absolute paths, parent references, and NUL bytes are rejected.
fn sanitize_relative_path(rel_path: &str) -> Option<PathBuf> {
    if rel_path.contains('\0') {
        return None;
    }
    let trimmed = rel_path.trim().trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        return None;
    }

    let normalized = trimmed.replace('\\', "/");
    let mut safe = PathBuf::new();
    for component in PathBuf::from(normalized).components() {
        match component {
            Component::Normal(part) => safe.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if safe.as_os_str().is_empty() {
        None
    } else {
        Some(safe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_with_root(dir: &Path) -> UploadHandler {
        UploadHandler::new(UploadSettings {
            upload_dir: Some(dir.to_path_buf()),
            allow_upload: true,
        })
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize_relative_path("../etc/passwd").is_none());
        assert!(sanitize_relative_path("a/../../b").is_none());
        assert!(sanitize_relative_path("/").is_none());
        assert!(sanitize_relative_path("").is_none());
        assert!(sanitize_relative_path("file\0name").is_none());
        assert_eq!(
            sanitize_relative_path("/docs/./report.pdf"),
            Some(PathBuf::from("docs/report.pdf"))
        );
        assert_eq!(
            sanitize_relative_path("dir\\file.bin"),
            Some(PathBuf::from("dir/file.bin"))
        );
    }

    #[test]
    fn upload_writes_within_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handler = handler_with_root(dir.path());
        handler.start("sub/hello.txt", 5);
        assert!(handler.is_active());
        handler.write_chunk(b"hello");
        handler.finish();
        let written = fs::read(dir.path().join("sub/hello.txt")).expect("read");
        assert_eq!(written, b"hello");
    }

    #[test]
    fn traversal_attempt_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handler = handler_with_root(dir.path());
        handler.start("../escape.txt", 4);
        assert!(!handler.is_active());
    }

    #[test]
    fn size_mismatch_deletes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handler = handler_with_root(dir.path());
        handler.start("short.bin", 10);
        handler.write_chunk(b"abc");
        handler.finish();
        assert!(!dir.path().join("short.bin").exists());
    }

    #[test]
    fn overrun_aborts_and_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handler = handler_with_root(dir.path());
        handler.start("small.bin", 2);
        handler.write_chunk(b"way too much data");
        assert!(!handler.is_active());
        assert!(!dir.path().join("small.bin").exists());
    }

    #[test]
    fn error_abort_removes_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handler = handler_with_root(dir.path());
        handler.start("partial.bin", 100);
        handler.write_chunk(b"data");
        handler.abort();
        assert!(!dir.path().join("partial.bin").exists());
    }
}
