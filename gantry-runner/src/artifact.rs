//! Artifact store
//!
//! Versioned, immutable hand-off between stages. Content is addressed by its
//! SHA-256 digest under `objects/<digest>`; every `put` appends a new version
//! record under `refs/<name>/`. Stored content is never rewritten.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::domain::artifact::ArtifactRef;
use gantry_core::domain::run::RunId;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ArtifactError;

const OBJECTS: &str = "objects";
const REFS: &str = "refs";
const MAX_VERSION_ATTEMPTS: usize = 16;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores the tree under `source` as a new version of `name`
    ///
    /// `.git` directories are not part of the artifact.
    async fn put(
        &self,
        name: &str,
        producer: &str,
        run_id: RunId,
        source: &Path,
    ) -> Result<ArtifactRef, ArtifactError>;

    /// Materializes an artifact version into `dest`, verifying its digest
    async fn checkout(&self, artifact: &ArtifactRef, dest: &Path) -> Result<(), ArtifactError>;

    /// Latest version of `name`, if any was ever stored
    async fn latest(&self, name: &str) -> Result<Option<ArtifactRef>, ArtifactError>;
}

/// Filesystem-backed artifact store
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        name: &str,
        producer: &str,
        run_id: RunId,
        source: &Path,
    ) -> Result<ArtifactRef, ArtifactError> {
        validate_name(name)?;

        let root = self.root.clone();
        let name = name.to_string();
        let producer = producer.to_string();
        let source = source.to_path_buf();

        let artifact = blocking(move || {
            let digest = tree_digest(&source)?;
            store_object(&root, &source, &digest)?;
            record_version(&root, &name, &producer, run_id, &digest)
        })
        .await?;

        info!("Stored artifact {} from run {}", artifact, run_id);
        Ok(artifact)
    }

    async fn checkout(&self, artifact: &ArtifactRef, dest: &Path) -> Result<(), ArtifactError> {
        let object = self.root.join(&artifact.location);
        let dest = dest.to_path_buf();
        let expected = artifact.digest.clone();
        let label = artifact.to_string();
        let (name, version) = (artifact.name.clone(), artifact.version);

        blocking(move || {
            if !object.is_dir() {
                return Err(ArtifactError::NotFound { name, version });
            }
            fs::create_dir_all(&dest)?;
            copy_tree(&object, &dest)?;

            if tree_digest(&dest)? != expected {
                return Err(ArtifactError::Corrupt { digest: expected });
            }
            Ok(())
        })
        .await?;

        debug!("Checked out artifact {}", label);
        Ok(())
    }

    async fn latest(&self, name: &str) -> Result<Option<ArtifactRef>, ArtifactError> {
        validate_name(name)?;
        let dir = self.root.join(REFS).join(name);

        blocking(move || {
            let Some(version) = latest_version(&dir)? else {
                return Ok(None);
            };
            let content = fs::read(version_path(&dir, version))?;
            Ok(Some(serde_json::from_slice(&content)?))
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ArtifactError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ArtifactError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArtifactError::Task(e.to_string()))?
}

fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

/// Copies the tree into `objects/<digest>` unless that object already exists
fn store_object(root: &Path, source: &Path, digest: &str) -> Result<(), ArtifactError> {
    let objects = root.join(OBJECTS);
    let target = objects.join(digest);
    if target.is_dir() {
        debug!("Artifact object {} already stored", digest);
        return Ok(());
    }

    let staging = objects.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&staging)?;
    copy_tree(source, &staging)?;

    match fs::rename(&staging, &target) {
        Ok(()) => Ok(()),
        // Another writer stored identical content first
        Err(_) if target.is_dir() => {
            fs::remove_dir_all(&staging)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            Err(e.into())
        }
    }
}

/// Appends the next version record; `create_new` keeps versions unique across writers
fn record_version(
    root: &Path,
    name: &str,
    producer: &str,
    run_id: RunId,
    digest: &str,
) -> Result<ArtifactRef, ArtifactError> {
    let dir = root.join(REFS).join(name);
    fs::create_dir_all(&dir)?;

    for _ in 0..MAX_VERSION_ATTEMPTS {
        let version = latest_version(&dir)?.unwrap_or(0) + 1;
        let artifact = ArtifactRef {
            name: name.to_string(),
            version,
            digest: digest.to_string(),
            producer: producer.to_string(),
            run_id,
            location: format!("{}/{}", OBJECTS, digest),
            created_at: Utc::now(),
        };

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(version_path(&dir, version));

        match file {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec_pretty(&artifact)?)?;
                file.sync_all()?;
                return Ok(artifact);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(ArtifactError::Task(format!(
        "could not allocate a version for artifact '{}'",
        name
    )))
}

fn version_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{:020}.json", version))
}

fn latest_version(dir: &Path) -> Result<Option<u64>, ArtifactError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut latest = None;
    for entry in entries {
        let file_name = entry?.file_name();
        let version = file_name
            .to_str()
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(version) = version {
            latest = latest.max(Some(version));
        }
    }
    Ok(latest)
}

/// Regular files of a tree in name order, relative to its root; `.git` and symlinks are skipped
fn tree_files(root: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git");

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        files.push(relative.to_path_buf());
    }

    Ok(files)
}

/// SHA-256 over every file's relative path, length and content
pub(crate) fn tree_digest(root: &Path) -> Result<String, std::io::Error> {
    let mut hasher = Sha256::new();
    for relative in tree_files(root)? {
        let content = fs::read(root.join(&relative))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    for relative in tree_files(from)? {
        let target = to.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from.join(&relative), target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_put_assigns_increasing_versions() {
        let store_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "template.yml", "Resources: {}");

        let store = FsArtifactStore::new(store_dir.path());
        let first = store.put("SourceOutput", "Source", 1, source.path()).await.unwrap();
        write(source.path(), "template.yml", "Resources: {Bucket: {}}");
        let second = store.put("SourceOutput", "Source", 2, source.path()).await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_ne!(first.digest, second.digest);
        assert_eq!(second.run_id, 2);

        let latest = store.latest("SourceOutput").await.unwrap().unwrap();
        assert_eq!(latest, second);
        assert!(store.latest("Unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identical_content_shares_object() {
        let store_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "a/b.txt", "same");

        let store = FsArtifactStore::new(store_dir.path());
        let first = store.put("Out", "Source", 1, source.path()).await.unwrap();
        let second = store.put("Out", "Source", 2, source.path()).await.unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.location, second.location);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_git_directory_is_excluded() {
        let store_dir = tempfile::tempdir().unwrap();
        let with_git = tempfile::tempdir().unwrap();
        let without_git = tempfile::tempdir().unwrap();
        write(with_git.path(), "template.yml", "x");
        write(with_git.path(), ".git/HEAD", "ref: refs/heads/master");
        write(without_git.path(), "template.yml", "x");

        let store = FsArtifactStore::new(store_dir.path());
        let a = store.put("Out", "Source", 1, with_git.path()).await.unwrap();
        let b = store.put("Out", "Source", 2, without_git.path()).await.unwrap();
        assert_eq!(a.digest, b.digest);

        let dest = tempfile::tempdir().unwrap();
        store.checkout(&a, dest.path()).await.unwrap();
        assert!(dest.path().join("template.yml").is_file());
        assert!(!dest.path().join(".git").exists());
    }

    #[test]
    fn test_tree_files_walks_nested_dirs_in_name_order() {
        let tree = tempfile::tempdir().unwrap();
        write(tree.path(), "b/nested/deep.yml", "1");
        write(tree.path(), "a.yml", "2");
        write(tree.path(), "b/a.yml", "3");
        write(tree.path(), "b/.git/config", "4");
        write(tree.path(), ".git/HEAD", "5");
        #[cfg(unix)]
        std::os::unix::fs::symlink(tree.path().join("a.yml"), tree.path().join("link.yml")).unwrap();

        let files = tree_files(tree.path()).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("a.yml"),
                PathBuf::from("b/a.yml"),
                PathBuf::from("b/nested/deep.yml"),
            ]
        );

        let copy = tempfile::tempdir().unwrap();
        copy_tree(tree.path(), copy.path()).unwrap();
        assert_eq!(fs::read_to_string(copy.path().join("b/nested/deep.yml")).unwrap(), "1");
        assert!(!copy.path().join("b/.git").exists());
        assert_eq!(tree_digest(tree.path()).unwrap(), tree_digest(copy.path()).unwrap());
    }

    #[tokio::test]
    async fn test_checkout_round_trip_and_corruption() {
        let store_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "nested/dir/file.txt", "hello");

        let store = FsArtifactStore::new(store_dir.path());
        let artifact = store.put("Out", "Source", 1, source.path()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        store.checkout(&artifact, dest.path()).await.unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("nested/dir/file.txt")).unwrap(),
            "hello"
        );

        write(
            &store_dir.path().join(&artifact.location),
            "nested/dir/file.txt",
            "tampered",
        );
        let dest = tempfile::tempdir().unwrap();
        let result = store.checkout(&artifact, dest.path()).await;
        assert!(matches!(result, Err(ArtifactError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_missing_object_and_invalid_name() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(store_dir.path());

        let artifact = ArtifactRef {
            name: "Out".to_string(),
            version: 9,
            digest: "00".repeat(32),
            producer: "Source".to_string(),
            run_id: 1,
            location: "objects/missing".to_string(),
            created_at: Utc::now(),
        };
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            store.checkout(&artifact, dest.path()).await,
            Err(ArtifactError::NotFound { version: 9, .. })
        ));

        let source = tempfile::tempdir().unwrap();
        assert!(matches!(
            store.put("../escape", "Source", 1, source.path()).await,
            Err(ArtifactError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_puts_get_distinct_versions() {
        let store_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "f", "x");

        let store = std::sync::Arc::new(FsArtifactStore::new(store_dir.path()));
        let mut handles = Vec::new();
        for run in 0..8 {
            let store = store.clone();
            let path = source.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                store.put("Out", "Source", run, &path).await.unwrap().version
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>());
    }
}
