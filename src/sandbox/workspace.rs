//! Workspace store
//!
//! Maps a session key to `<root>/<key>/{code,data,output}`. Directories are
//! created lazily and never deleted here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result, ValidationError};

/// Longest accepted file name
pub const MAX_FILE_NAME_LEN: usize = 128;

/// Longest normalized session key
pub const MAX_SESSION_KEY_LEN: usize = 128;

/// One of the three workspace subdirectories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceDir {
    Code,
    Data,
    Output,
}

impl WorkspaceDir {
    pub const ALL: [WorkspaceDir; 3] = [WorkspaceDir::Code, WorkspaceDir::Data, WorkspaceDir::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceDir::Code => "code",
            WorkspaceDir::Data => "data",
            WorkspaceDir::Output => "output",
        }
    }

    /// Mount point inside an execution unit
    pub fn container_path(&self) -> &'static str {
        match self {
            WorkspaceDir::Code => "/code",
            WorkspaceDir::Data => "/data",
            WorkspaceDir::Output => "/output",
        }
    }

    /// Only `output/` is ever mounted writable
    pub fn is_writable_in_unit(&self) -> bool {
        matches!(self, WorkspaceDir::Output)
    }
}

impl std::str::FromStr for WorkspaceDir {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "code" => Ok(WorkspaceDir::Code),
            "data" => Ok(WorkspaceDir::Data),
            "output" => Ok(WorkspaceDir::Output),
            _ => Err(Error::InvalidInput(format!(
                "Unknown workspace directory: {}. Valid: code, data, output",
                s
            ))),
        }
    }
}

impl std::fmt::Display for WorkspaceDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a session key: lowercase, runs of non-alphanumerics become `_`
pub fn normalize_session_key(key: &str) -> std::result::Result<String, ValidationError> {
    let mut normalized = String::with_capacity(key.len());
    let mut pending_sep = false;

    for c in key.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_sep = false;
            normalized.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if normalized.is_empty() || normalized.len() > MAX_SESSION_KEY_LEN {
        return Err(ValidationError::InvalidSessionKey(key.to_string()));
    }
    Ok(normalized)
}

/// Check a file name against `[A-Za-z0-9._-]`, no leading `.` or `-`
pub fn validate_file_name(name: &str) -> std::result::Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_FILE_NAME_LEN
        && !name.starts_with('.')
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidFileName(name.to_string()))
    }
}

/// Resolves session keys to workspaces under a single root
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open (creating if needed) the workspace for a session key
    pub async fn open(&self, session_key: &str) -> Result<Workspace> {
        let key = normalize_session_key(session_key)?;

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Workspace(format!(
                "Failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;
        let root = canonical(&self.root).await?;

        let dir = root.join(&key);
        create_dir_if_absent(&dir).await?;
        let dir = canonical(&dir).await?;
        if !dir.starts_with(&root) || dir == root {
            return Err(Error::Workspace(format!(
                "Workspace path {} is outside {}",
                dir.display(),
                root.display()
            )));
        }

        for sub in WorkspaceDir::ALL {
            create_dir_if_absent(&dir.join(sub.as_str())).await?;
        }

        debug!("Opened workspace '{}' at {}", key, dir.display());

        Ok(Workspace { key, root: dir })
    }
}

/// Persistent per-session directory triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    key: String,
    root: PathBuf,
}

/// A file inside a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub name: String,
    /// Path relative to the workspace root
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Summary of a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub key: String,
    pub path: PathBuf,
    pub code_files: usize,
    pub data_files: usize,
    pub output_files: usize,
    pub total_files: usize,
    pub total_size: u64,
}

impl Workspace {
    /// Normalized session key
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: WorkspaceDir) -> PathBuf {
        self.root.join(dir.as_str())
    }

    pub fn code_dir(&self) -> PathBuf {
        self.dir(WorkspaceDir::Code)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir(WorkspaceDir::Data)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir(WorkspaceDir::Output)
    }

    fn file_path(&self, dir: WorkspaceDir, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.dir(dir).join(name))
    }

    /// Write a file, replacing any existing regular file of that name
    pub async fn write_file(&self, dir: WorkspaceDir, name: &str, content: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.file_path(dir, name)?;

        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if !meta.is_file() => {
                return Err(Error::Workspace(format!(
                    "Refusing to overwrite non-regular file {}",
                    path.display()
                )));
            }
            _ => {}
        }

        tokio::fs::write(&path, content).await.map_err(|e| {
            Error::Workspace(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Read a file; `None` when it does not exist
    pub async fn read_file(&self, dir: WorkspaceDir, name: &str) -> Result<Option<String>> {
        let path = self.file_path(dir, name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Workspace(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn exists(&self, dir: WorkspaceDir, name: &str) -> bool {
        match self.file_path(dir, name) {
            Ok(path) => tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete a file; false when it did not exist
    pub async fn delete_file(&self, dir: WorkspaceDir, name: &str) -> Result<bool> {
        let path = self.file_path(dir, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Workspace(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// List files recursively, in one subdirectory or the whole workspace
    ///
    /// Symlinks are skipped, not followed.
    pub async fn list_files(&self, dir: Option<WorkspaceDir>) -> Result<Vec<WorkspaceFile>> {
        let start = match dir {
            Some(dir) => self.dir(dir),
            None => self.root.clone(),
        };

        let mut files = Vec::new();
        let mut pending = vec![start];

        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Workspace(format!(
                        "Failed to list {}: {}",
                        current.display(),
                        e
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let meta = entry.metadata().await?;
                    let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
                    files.push(WorkspaceFile {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        path: relative,
                        size: meta.len(),
                        modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// File counts per subdirectory and total size
    pub async fn info(&self) -> Result<WorkspaceInfo> {
        let files = self.list_files(None).await?;
        let count = |dir: WorkspaceDir| {
            files
                .iter()
                .filter(|f| f.path.starts_with(dir.as_str()))
                .count()
        };

        Ok(WorkspaceInfo {
            key: self.key.clone(),
            path: self.root.clone(),
            code_files: count(WorkspaceDir::Code),
            data_files: count(WorkspaceDir::Data),
            output_files: count(WorkspaceDir::Output),
            total_files: files.len(),
            total_size: files.iter().map(|f| f.size).sum(),
        })
    }
}

/// Exclusive create; an existing real directory is fine, anything else is not
async fn create_dir_if_absent(path: &Path) -> Result<()> {
    match tokio::fs::create_dir(path).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(Error::Workspace(format!(
                "Failed to create {}: {}",
                path.display(),
                e
            )))
        }
    }

    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return Err(Error::Workspace(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    Ok(())
}

async fn canonical(path: &Path) -> Result<PathBuf> {
    tokio::fs::canonicalize(path).await.map_err(|e| {
        Error::Workspace(format!("Failed to resolve {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_session_key() {
        assert_eq!(normalize_session_key("Team Chat").unwrap(), "team_chat");
        assert_eq!(normalize_session_key("  a--b__c ").unwrap(), "a_b_c");
        assert_eq!(normalize_session_key("../../etc/passwd").unwrap(), "etc_passwd");
        assert_eq!(normalize_session_key("MiXeD42").unwrap(), "mixed42");
        assert!(normalize_session_key("../..").is_err());
        assert!(normalize_session_key("").is_err());

        // Letters outside ASCII are kept, so distinct names stay distinct
        assert_eq!(normalize_session_key("日本語チャット").unwrap(), "日本語チャット");
        assert_eq!(normalize_session_key("Über Team").unwrap(), "über_team");
        assert_ne!(
            normalize_session_key("über").unwrap(),
            normalize_session_key("ber").unwrap()
        );
        assert!(normalize_session_key("→/←").is_err());
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("main.py").is_ok());
        assert!(validate_file_name("solver_v2-final.go").is_ok());
        assert!(validate_file_name("../escape.py").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("-rf").is_err());
        assert!(validate_file_name("a b.py").is_err());
        assert!(validate_file_name(&"x".repeat(MAX_FILE_NAME_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().join("workspaces"));

        let first = store.open("Team Chat").await.unwrap();
        let second = store.open("team-chat").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key(), "team_chat");

        for sub in WorkspaceDir::ALL {
            assert!(first.dir(sub).is_dir());
        }
        let root = std::fs::canonicalize(dir.path().join("workspaces")).unwrap();
        assert!(first.root().starts_with(&root));

        let unicode = store.open("日本語チャット").await.unwrap();
        let umlaut = store.open("über").await.unwrap();
        let plain = store.open("ber").await.unwrap();
        assert_eq!(unicode.root(), root.join("日本語チャット"));
        assert_ne!(umlaut.root(), plain.root());
    }

    #[tokio::test]
    async fn test_file_round_trip_and_info() {
        let dir = tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());
        let ws = store.open("analysis").await.unwrap();

        ws.write_file(WorkspaceDir::Data, "input.csv", "a,b\n1,2\n").await.unwrap();
        ws.write_file(WorkspaceDir::Code, "main.py", "print(1)").await.unwrap();
        assert!(ws.exists(WorkspaceDir::Data, "input.csv").await);
        assert!(!ws.exists(WorkspaceDir::Output, "input.csv").await);
        assert_eq!(
            ws.read_file(WorkspaceDir::Code, "main.py").await.unwrap().as_deref(),
            Some("print(1)")
        );
        assert!(ws.read_file(WorkspaceDir::Output, "none.txt").await.unwrap().is_none());

        let info = ws.info().await.unwrap();
        assert_eq!(info.code_files, 1);
        assert_eq!(info.data_files, 1);
        assert_eq!(info.output_files, 0);
        assert_eq!(info.total_size, 16);

        let listed = ws.list_files(Some(WorkspaceDir::Data)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, PathBuf::from("data/input.csv"));

        assert!(ws.delete_file(WorkspaceDir::Code, "main.py").await.unwrap());
        assert!(!ws.delete_file(WorkspaceDir::Code, "main.py").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_rejects_bad_names() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceStore::new(dir.path()).open("s").await.unwrap();
        let err = ws
            .write_file(WorkspaceDir::Code, "../../x.py", "boom")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::InvalidFileName(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_session_is_rejected() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("evil")).unwrap();

        let store = WorkspaceStore::new(dir.path());
        assert!(matches!(store.open("evil").await, Err(Error::Workspace(_))));
    }
}
