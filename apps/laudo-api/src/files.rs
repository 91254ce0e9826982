//! On-disk storage for uploaded attachments
//!
//! Layout: `<data_dir>/uploads/<control number>/<kind>/<millis>-<name>`.
//! Paths recorded in the database are relative to the data directory and
//! always use `/`.

use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const UPLOADS_DIR: &str = "uploads";
pub const PHOTOS_DIR: &str = "fotos";

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "arquivo".to_string()
    } else {
        sanitized
    }
}

/// Move a stored path from one report's directory to another's.
///
/// Paths outside `uploads/<from>/` are returned unchanged (with `\`
/// normalised to `/`).
pub fn rebase_path(path: &str, from: &str, to: &str) -> String {
    let normalized = path.replace('\\', "/");
    let prefix = format!("{}/{}/", UPLOADS_DIR, from);
    match normalized.strip_prefix(&prefix) {
        Some(rest) => format!("{}/{}/{}", UPLOADS_DIR, to, rest),
        None => normalized,
    }
}

/// Attachment storage rooted at the data directory
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every attachment of one report
    pub fn report_dir(&self, control: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(UPLOADS_DIR).join(checked_segment(control)?))
    }

    /// Resolve a stored relative path, refusing anything that escapes the
    /// data directory
    pub fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let normalized = relative.replace('\\', "/");
        let path = Path::new(&normalized);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || normalized.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing attachment path {:?}", relative),
            ));
        }
        Ok(self.root.join(path))
    }

    /// Write an upload and return its stored relative path.
    ///
    /// Never overwrites: a name clash within the same millisecond gets a
    /// numeric suffix.
    pub async fn store(
        &self,
        control: &str,
        kind: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> io::Result<String> {
        let control = checked_segment(control)?;
        let kind = checked_segment(kind)?;
        let dir = self.root.join(UPLOADS_DIR).join(control).join(kind);
        tokio::fs::create_dir_all(&dir).await?;

        let base = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_filename(original_name)
        );
        let mut attempt = 0u32;
        loop {
            let file_name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", attempt, base)
            };
            let target = dir.join(&file_name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
            {
                Ok(mut file) => {
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    debug!("Stored {} bytes at {}", bytes.len(), target.display());
                    return Ok(format!("{}/{}/{}/{}", UPLOADS_DIR, control, kind, file_name));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete a stored file. Returns `false` if it was already gone.
    pub async fn remove_file(&self, relative: &str) -> io::Result<bool> {
        let path = self.resolve(relative)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Attachment already missing: {}", path.display());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a report's whole attachment tree, tolerating its absence
    pub async fn remove_report_dir(&self, control: &str) -> io::Result<()> {
        let dir = self.report_dir(control)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Recursively copy one report's attachment tree to a freshly allocated
    /// control number. Anything already under the target directory is
    /// removed first. Returns the number of files copied; a report without
    /// attachments copies nothing.
    pub async fn copy_report_tree(&self, from: &str, to: &str) -> io::Result<u64> {
        let source = self.report_dir(from)?;
        let target = self.report_dir(to)?;
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(io::Error::other)?
    }
}

/// A single path segment that cannot climb out of its parent
fn checked_segment(segment: &str) -> io::Result<&str> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid directory name {:?}", segment),
        ));
    }
    Ok(segment)
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<u64> {
    if target.exists() {
        warn!("Clearing leftover attachments in {}", target.display());
        std::fs::remove_dir_all(target)?;
    }
    if !source.exists() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("foto da sala.jpg"), "foto_da_sala.jpg");
        assert_eq!(sanitize_filename("çãé.png"), "___.png");
        assert_eq!(sanitize_filename(""), "arquivo");
    }

    #[test]
    fn test_rebase_path() {
        assert_eq!(
            rebase_path("uploads/RL 001-2024/fotos/1-a.jpg", "RL 001-2024", "RL 002-2024"),
            "uploads/RL 002-2024/fotos/1-a.jpg"
        );
        assert_eq!(
            rebase_path("uploads\\RL 001-2024\\outros\\b.pdf", "RL 001-2024", "RL 009-2024"),
            "uploads/RL 009-2024/outros/b.pdf"
        );
        assert_eq!(rebase_path("elsewhere/c.pdf", "RL 001-2024", "X"), "elsewhere/c.pdf");
    }

    #[test]
    fn test_resolve_refuses_escapes() {
        let store = UploadStore::new("/data");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("uploads/../../x").is_err());
        assert_eq!(
            store.resolve("uploads/RL 001-2024/fotos/a.jpg").unwrap(),
            PathBuf::from("/data/uploads/RL 001-2024/fotos/a.jpg")
        );
    }

    #[test]
    fn test_report_dir_rejects_separators() {
        let store = UploadStore::new("/data");
        assert!(store.report_dir("..").is_err());
        assert!(store.report_dir("a/b").is_err());
        assert!(store.report_dir("RL 001-2024").is_ok());
    }

    #[tokio::test]
    async fn test_store_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());

        let first = store.store("RL 001-2024", PHOTOS_DIR, "a.jpg", b"one").await.unwrap();
        let second = store.store("RL 001-2024", PHOTOS_DIR, "a.jpg", b"two").await.unwrap();

        assert!(first.starts_with("uploads/RL 001-2024/fotos/"));
        assert_ne!(first, second);
        let read = std::fs::read(store.resolve(&first).unwrap()).unwrap();
        assert_eq!(read, b"one");
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        assert!(!store.remove_file("uploads/X/fotos/none.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_report_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        let stored = store
            .store("RL 001-2024", "certidao_onus", "c.pdf", b"%PDF")
            .await
            .unwrap();

        let copied = store.copy_report_tree("RL 001-2024", "RL 002-2024").await.unwrap();
        assert_eq!(copied, 1);

        let rebased = rebase_path(&stored, "RL 001-2024", "RL 002-2024");
        assert!(store.resolve(&rebased).unwrap().exists());
        assert!(store.resolve(&stored).unwrap().exists());

        assert_eq!(store.copy_report_tree("RL 404-2024", "RL 405-2024").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_copy_report_tree_replaces_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        store.store("RL 001-2024", PHOTOS_DIR, "a.jpg", b"new").await.unwrap();
        let leftover = store
            .store("RL 002-2024", PHOTOS_DIR, "old.jpg", b"old")
            .await
            .unwrap();

        let copied = store.copy_report_tree("RL 001-2024", "RL 002-2024").await.unwrap();
        assert_eq!(copied, 1);
        assert!(!store.resolve(&leftover).unwrap().exists());
        let remaining = WalkDir::new(store.report_dir("RL 002-2024").unwrap())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .count();
        assert_eq!(remaining, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Property: sanitized names keep their length and only safe characters
            #[test]
            fn sanitized_names_are_safe(name in ".{1,40}") {
                let sanitized = sanitize_filename(&name);
                prop_assert_eq!(sanitized.chars().count(), name.chars().count());
                prop_assert!(sanitized
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
            }

            /// Property: a stored upload path always resolves inside the root
            #[test]
            fn stored_paths_resolve_inside_root(
                seq in 1u32..1000,
                year in 2000i32..2100,
                name in "[a-zA-Z0-9 ._-]{1,20}",
            ) {
                let store = UploadStore::new("/data");
                let relative = format!(
                    "{}/RL {:03}-{}/{}/1-{}",
                    UPLOADS_DIR, seq, year, PHOTOS_DIR, sanitize_filename(&name)
                );
                let resolved = store.resolve(&relative).unwrap();
                prop_assert!(resolved.starts_with("/data/uploads"));
            }

            /// Property: rebasing there and back restores the path
            #[test]
            fn rebase_round_trips(file in "[a-z0-9_.-]{1,20}") {
                let path = format!("uploads/RL 001-2024/fotos/{}", file);
                let moved = rebase_path(&path, "RL 001-2024", "RL 002-2024");
                prop_assert_eq!(rebase_path(&moved, "RL 002-2024", "RL 001-2024"), path);
            }
        }
    }
}
