//! Policy-gated filesystem operations: read, write, list, delete, tail.
//!
//! Every entry validates its path first. Mutating operations report
//! failures in the structured [`ActionResult`] shape; destructive ones
//! additionally re-resolve symlinks and re-validate the real target.

use crate::security::{PathValidator, PolicyError};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;
use warden_common::{b64, ActionResult, DirListing, FileContent, FileInfo};

/// Poll cadence for `tail --follow`; cancellation is observed within one
/// interval.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Directories that may never be deleted, allowed prefixes notwithstanding.
const PROTECTED_ROOTS: &[&str] =
    &["/", "/bin", "/sbin", "/usr", "/etc", "/var", "/boot", "/root", "/home"];

#[derive(Debug, thiserror::Error)]
pub enum FileOpError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal failure: {0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct FileOps {
    paths: PathValidator,
}

impl FileOps {
    pub fn new(paths: PathValidator) -> Self {
        Self { paths }
    }

    pub async fn read_file(&self, path: &str) -> Result<FileContent, FileOpError> {
        let cleaned = self.paths.validate(path)?;

        let info = stat_info(&cleaned)
            .map_err(|_| FileOpError::NotFound(cleaned.to_string_lossy().to_string()))?;
        let content = tokio::fs::read(&cleaned).await?;

        Ok(FileContent { content: b64::encode(&content), info })
    }

    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        mode: u32,
        create_dirs: bool,
    ) -> ActionResult {
        let cleaned = match self.paths.validate_for_write(path) {
            Ok(p) => p,
            Err(e) => return ActionResult::fail(format!("write path rejected: {e}")),
        };

        if create_dirs {
            if let Some(parent) = cleaned.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ActionResult::fail(format!("failed to create directories: {e}"));
                }
            }
        }

        if let Err(e) = tokio::fs::write(&cleaned, content).await {
            return ActionResult::fail(e.to_string());
        }

        if mode != 0 {
            let perms = std::fs::Permissions::from_mode(mode);
            if let Err(e) = tokio::fs::set_permissions(&cleaned, perms).await {
                warn!(path = %cleaned.display(), "failed to set file mode: {e}");
            }
        }

        ActionResult::ok("file saved")
    }

    pub async fn list_directory(
        &self,
        path: &str,
        recursive: bool,
        show_hidden: bool,
    ) -> Result<DirListing, FileOpError> {
        let cleaned = self.paths.validate(path)?;

        let meta = tokio::fs::metadata(&cleaned)
            .await
            .map_err(|_| FileOpError::NotFound(cleaned.to_string_lossy().to_string()))?;
        if !meta.is_dir() {
            return Err(FileOpError::NotFound(format!(
                "{} is not a directory",
                cleaned.display()
            )));
        }

        let root = cleaned.clone();
        let files = tokio::task::spawn_blocking(move || {
            let max_depth = if recursive { usize::MAX } else { 1 };
            let mut files = Vec::new();
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .max_depth(max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(move |entry| {
                    show_hidden
                        || !entry.file_name().to_string_lossy().starts_with('.')
                });
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        debug!("skipping unreadable entry: {e}");
                        continue;
                    }
                };
                match stat_info(entry.path()) {
                    Ok(info) => files.push(info),
                    Err(e) => debug!(path = %entry.path().display(), "stat failed: {e}"),
                }
            }
            files
        })
        .await
        .map_err(|e| FileOpError::Internal(e.to_string()))?;

        Ok(DirListing { path: cleaned.to_string_lossy().to_string(), files })
    }

    /// Delete a file or directory tree. Destructive, so beyond write
    /// validation this re-validates the symlink-resolved target and
    /// refuses filesystem roots outright.
    pub async fn delete(&self, path: &str) -> ActionResult {
        let cleaned = match self.paths.validate_for_write(path) {
            Ok(p) => p,
            Err(e) => return ActionResult::fail(format!("delete path rejected: {e}")),
        };

        if let Ok(real) = tokio::fs::canonicalize(&cleaned).await {
            if real != cleaned {
                if let Err(e) = self.paths.validate_for_write(&real.to_string_lossy()) {
                    return ActionResult::fail(format!("symlink target rejected: {e}"));
                }
            }
        }

        for root in PROTECTED_ROOTS {
            if cleaned == Path::new(root) {
                return ActionResult::fail("refusing to delete a filesystem root");
            }
        }

        let meta = match tokio::fs::symlink_metadata(&cleaned).await {
            Ok(m) => m,
            Err(e) => return ActionResult::fail(format!("not found: {e}")),
        };

        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&cleaned).await
        } else {
            tokio::fs::remove_file(&cleaned).await
        };

        match result {
            Ok(()) => ActionResult::ok("file deleted"),
            Err(e) => ActionResult::fail(e.to_string()),
        }
    }

    /// Send the last `lines` lines of a file into `tx`, then keep
    /// following appended data when `follow` is set. Returns when the
    /// receiver is dropped, the file disappears, or (without `follow`)
    /// the backlog is delivered. Truncation or rotation resets the read
    /// offset to the start of the file.
    pub async fn tail_into(
        &self,
        path: &str,
        lines: u32,
        follow: bool,
        tx: mpsc::Sender<String>,
    ) -> Result<(), FileOpError> {
        let cleaned = self.paths.validate(path)?;
        tokio::fs::metadata(&cleaned)
            .await
            .map_err(|_| FileOpError::NotFound(cleaned.to_string_lossy().to_string()))?;

        let backlog_path = cleaned.clone();
        let (backlog, mut offset) =
            tokio::task::spawn_blocking(move || read_last_lines(&backlog_path, lines as usize))
                .await
                .map_err(|e| FileOpError::Internal(e.to_string()))??;

        for line in backlog {
            if tx.send(line).await.is_err() {
                return Ok(());
            }
        }

        if !follow {
            return Ok(());
        }

        let mut pending = String::new();
        loop {
            tokio::select! {
                _ = tx.closed() => return Ok(()),
                _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
            }

            let len = match tokio::fs::metadata(&cleaned).await {
                Ok(m) => m.len(),
                // rotated away entirely; end of stream
                Err(_) => return Ok(()),
            };
            if len < offset {
                offset = 0;
                pending.clear();
            }
            if len == offset {
                continue;
            }

            let chunk_path = cleaned.clone();
            let chunk = tokio::task::spawn_blocking(move || read_from(&chunk_path, offset))
                .await
                .map_err(|e| FileOpError::Internal(e.to_string()))??;
            offset += chunk.len() as u64;

            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = pending.find('\n') {
                let line = pending[..idx].to_string();
                pending.drain(..=idx);
                if tx.send(line).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Stat one path into the wire shape, resolving owner and group names.
fn stat_info(path: &Path) -> std::io::Result<FileInfo> {
    let meta = std::fs::metadata(path)?;

    let owner = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(meta.uid()))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| meta.uid().to_string());
    let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(meta.gid()))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| meta.gid().to_string());

    Ok(FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string()),
        path: path.to_string_lossy().to_string(),
        size: meta.len(),
        mode: meta.permissions().mode() & 0o7777,
        modified: meta.mtime(),
        is_dir: meta.is_dir(),
        owner,
        group,
    })
}

/// Read the last `n` lines of a file by scanning backwards in blocks.
/// Returns the lines and the file length at read time (the follow offset).
fn read_last_lines(path: &Path, n: usize) -> std::io::Result<(Vec<String>, u64)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if n == 0 || len == 0 {
        return Ok((Vec::new(), len));
    }

    let mut buf = vec![0u8; 8192];
    let mut pos = len;
    let mut newlines = 0usize;
    let mut start = 0u64;

    'scan: while pos > 0 {
        let read_len = buf.len().min(pos as usize);
        pos -= read_len as u64;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf[..read_len])?;

        for i in (0..read_len).rev() {
            if buf[i] == b'\n' {
                let absolute = pos + i as u64;
                // a trailing newline does not start a line
                if absolute + 1 == len {
                    continue;
                }
                newlines += 1;
                if newlines == n {
                    start = absolute + 1;
                    break 'scan;
                }
            }
        }
    }

    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let lines = String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect();
    Ok((lines, len))
}

/// Read everything from `offset` to the current end of file.
fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityConfig;
    use std::sync::Arc;

    fn ops() -> FileOps {
        FileOps::new(PathValidator::new(Arc::new(SecurityConfig::default())))
    }

    fn tempdir() -> tempfile::TempDir {
        // /tmp is inside the default allowed prefixes
        tempfile::Builder::new().prefix("wardend-fileops").tempdir_in("/tmp").unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempdir();
        let path = dir.path().join("note.txt");
        let path = path.to_string_lossy();

        let result = ops().write_file(&path, b"hello warden", 0, false).await;
        assert!(result.success, "{}", result.error);

        let content = ops().read_file(&path).await.unwrap();
        assert_eq!(b64::decode(&content.content).unwrap(), b"hello warden");
        assert_eq!(content.info.name, "note.txt");
        assert!(!content.info.is_dir);
    }

    #[tokio::test]
    async fn write_to_system_critical_path_is_refused() {
        let result = ops().write_file("/etc/passwd", b"oops", 0, false).await;
        assert!(!result.success);
        assert!(result.error.contains("rejected"));
    }

    #[tokio::test]
    async fn read_outside_allowed_prefixes_is_refused() {
        let err = ops().read_file("/usr/lib/os-release").await.unwrap_err();
        assert!(matches!(err, FileOpError::Policy(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir();
        let path = dir.path().join("absent");
        let err = ops().read_file(&path.to_string_lossy()).await.unwrap_err();
        assert!(matches!(err, FileOpError::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_respects_hidden_and_recursion() {
        let dir = tempdir();
        std::fs::write(dir.path().join("visible.txt"), "a").unwrap();
        std::fs::write(dir.path().join(".hidden"), "b").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/nested.txt"), "c").unwrap();

        let ops = ops();
        let base = dir.path().to_string_lossy();

        let flat = ops.list_directory(&base, false, false).await.unwrap();
        let names: Vec<_> = flat.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "visible.txt"]);

        let all = ops.list_directory(&base, true, true).await.unwrap();
        let names: Vec<_> = all.files.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&".hidden"));
        assert!(names.contains(&"nested.txt"));
    }

    #[tokio::test]
    async fn delete_refuses_roots_and_removes_files() {
        let ops = ops();

        let result = ops.delete("/home").await;
        assert!(!result.success);
        assert!(result.error.contains("filesystem root"));

        let dir = tempdir();
        let file = dir.path().join("doomed");
        std::fs::write(&file, "x").unwrap();
        let result = ops.delete(&file.to_string_lossy()).await;
        assert!(result.success, "{}", result.error);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn delete_revalidates_symlink_target() {
        let dir = tempdir();
        let link = dir.path().join("sneaky");
        // points at a write-restricted path; the resolved target is
        // re-validated and refused
        std::os::unix::fs::symlink("/etc/passwd", &link).unwrap();

        let result = ops().delete(&link.to_string_lossy()).await;
        assert!(!result.success);
        assert!(result.error.contains("symlink target rejected"));
        assert!(link.exists() || std::fs::symlink_metadata(&link).is_ok());
    }

    #[test]
    fn last_lines_backward_scan() {
        let dir = tempdir();
        let path = dir.path().join("log");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let (lines, offset) = read_last_lines(&path, 2).unwrap();
        assert_eq!(lines, vec!["three", "four"]);
        assert_eq!(offset, 19);

        // no trailing newline
        std::fs::write(&path, "one\ntwo\nthree").unwrap();
        let (lines, _) = read_last_lines(&path, 2).unwrap();
        assert_eq!(lines, vec!["two", "three"]);

        // asking for more lines than exist returns everything
        let (lines, _) = read_last_lines(&path, 50).unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn tail_without_follow_sends_backlog_and_ends() {
        let dir = tempdir();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a\nb\nc\n").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        ops().tail_into(&path.to_string_lossy(), 2, false, tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "b");
        assert_eq!(rx.recv().await.unwrap(), "c");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn tail_follow_picks_up_appends_and_stops_on_drop() {
        let dir = tempdir();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "start\n").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let ops = ops();
        let tail_path = path.to_string_lossy().to_string();
        let task = tokio::spawn(async move { ops.tail_into(&tail_path, 1, true, tx).await });

        assert_eq!(rx.recv().await.unwrap(), "start");

        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "appended").unwrap();
        }

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("appended line within poll interval")
            .unwrap();
        assert_eq!(line, "appended");

        drop(rx);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("tail task observes cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
