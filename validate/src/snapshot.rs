//! Backup and restore of a task's mutable `src/` tree.
//!
//! [`SnapshotHandle::snapshot`] copies `src/` into a sibling backup directory
//! and records a SHA-256 digest per file. The handle is the only way to
//! restore or discard that backup, so a backup cannot be applied to the wrong
//! task.
//!
//! Restore replaces `src/` wholesale: files a trial created are removed, and
//! files it deleted or edited come back byte-identical with their permission
//! bits. Symlinks are copied as links and never followed, so a link cycle
//! inside `src/` is harmless.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use rand::{Rng, distributions::Alphanumeric};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

/// Mutable directory inside every task.
pub const SOURCE_DIR: &str = "src";
/// Backup directories are named `src.val-bak-<suffix>`.
pub const BACKUP_PREFIX: &str = "src.val-bak-";

/// Relative file path -> hex SHA-256 of its contents.
pub type Manifest = BTreeMap<PathBuf, String>;

/// A captured copy of one task's `src/` tree.
///
/// Dropping the handle without calling [`SnapshotHandle::discard`] still
/// removes the backup directory (errors are logged, not returned).
#[derive(Debug)]
pub struct SnapshotHandle {
    source_dir: PathBuf,
    backup_dir: PathBuf,
    manifest: Manifest,
    discarded: bool,
}

impl SnapshotHandle {
    /// Copy `<task_dir>/src` into a fresh backup directory.
    ///
    /// Fails if `src/` is missing or any file cannot be read or written. A
    /// partially written backup is removed before the error is returned.
    #[instrument(skip_all, fields(task_dir = %task_dir.display()))]
    pub fn snapshot(task_dir: &Path) -> Result<Self> {
        let source_dir = task_dir.join(SOURCE_DIR);
        if !source_dir.is_dir() {
            bail!("source dir {} does not exist", source_dir.display());
        }
        let backup_dir = task_dir.join(format!("{BACKUP_PREFIX}{}", generate_short_id()));

        let manifest = match copy_tree(&source_dir, &backup_dir) {
            Ok(manifest) => manifest,
            Err(err) => {
                remove_backup(&backup_dir);
                return Err(err).context("snapshot source tree");
            }
        };

        debug!(
            files = manifest.len(),
            backup = %backup_dir.display(),
            "snapshot taken"
        );
        Ok(Self {
            source_dir,
            backup_dir,
            manifest,
            discarded: false,
        })
    }

    /// Replace `src/` with the backup, then check it against the manifest.
    #[instrument(skip_all, fields(source = %self.source_dir.display()))]
    pub fn restore(&self) -> Result<()> {
        if self.source_dir.exists() {
            fs::remove_dir_all(&self.source_dir)
                .with_context(|| format!("remove {}", self.source_dir.display()))?;
        }
        copy_tree(&self.backup_dir, &self.source_dir).context("copy backup into place")?;
        self.verify().context("verify restored tree")?;
        debug!("source tree restored");
        Ok(())
    }

    /// Compare the current `src/` against the manifest taken at snapshot time.
    ///
    /// Reports the first changed, missing, or unexpected file.
    pub fn verify(&self) -> Result<()> {
        let current = hash_tree(&self.source_dir)?;
        for (path, digest) in &self.manifest {
            match current.get(path) {
                Some(found) if found == digest => {}
                Some(_) => bail!("{} differs from snapshot", path.display()),
                None => bail!("{} missing after restore", path.display()),
            }
        }
        if let Some(extra) = current.keys().find(|path| !self.manifest.contains_key(*path)) {
            bail!("{} is not part of the snapshot", extra.display());
        }
        Ok(())
    }

    /// Remove the backup directory.
    pub fn discard(mut self) -> Result<()> {
        self.discarded = true;
        if self.backup_dir.exists() {
            fs::remove_dir_all(&self.backup_dir)
                .with_context(|| format!("remove backup {}", self.backup_dir.display()))?;
        }
        debug!(backup = %self.backup_dir.display(), "snapshot discarded");
        Ok(())
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Single digest over every `(path, file digest)` pair in the manifest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, digest) in &self.manifest {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(digest.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if !self.discarded {
            remove_backup(&self.backup_dir);
        }
    }
}

fn remove_backup(backup_dir: &Path) {
    if !backup_dir.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(backup_dir) {
        warn!(err = %err, backup = %backup_dir.display(), "failed to remove snapshot backup");
    }
}

/// Recursively copy `src` to `dst`, returning the manifest of copied files.
fn copy_tree(src: &Path, dst: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    copy_dir_recursive(src, dst, Path::new(""), &mut manifest)?;
    Ok(manifest)
}

fn copy_dir_recursive(
    src: &Path,
    dst: &Path,
    relative: &Path,
    manifest: &mut Manifest,
) -> Result<()> {
    if !src.exists() {
        return Err(anyhow!("missing {}", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let rel = relative.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_symlink() {
            manifest.insert(rel, copy_symlink(&path, &target)?);
        } else if file_type.is_dir() {
            copy_dir_recursive(&path, &target, &rel, manifest)?;
        } else {
            // fs::copy carries the permission bits over.
            fs::copy(&path, &target).with_context(|| {
                format!("copy {} -> {}", path.display(), target.display())
            })?;
            manifest.insert(rel, file_sha256(&target)?);
        }
    }
    Ok(())
}

/// Recreate the link itself; its target is never followed.
#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<String> {
    let link = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
    std::os::unix::fs::symlink(&link, dst)
        .with_context(|| format!("create link {}", dst.display()))?;
    Ok(symlink_digest(&link))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<String> {
    bail!("cannot copy symlink {} on this platform", src.display())
}

fn hash_tree(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    if root.exists() {
        hash_dir_recursive(root, Path::new(""), &mut manifest)?;
    }
    Ok(manifest)
}

fn hash_dir_recursive(dir: &Path, relative: &Path, manifest: &mut Manifest) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let rel = relative.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_symlink() {
            let link =
                fs::read_link(&path).with_context(|| format!("read link {}", path.display()))?;
            manifest.insert(rel, symlink_digest(&link));
        } else if file_type.is_dir() {
            hash_dir_recursive(&path, &rel, manifest)?;
        } else {
            manifest.insert(rel, file_sha256(&path)?);
        }
    }
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(sha256_hex(&contents))
}

/// Links hash their target path, prefixed so they never collide with a file
/// holding the same bytes.
fn symlink_digest(link: &Path) -> String {
    let mut bytes = b"symlink:".to_vec();
    bytes.extend_from_slice(link.to_string_lossy().as_bytes());
    sha256_hex(&bytes)
}

fn sha256_hex(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_task(root: &Path) -> PathBuf {
        let task_dir = root.join("task-001");
        fs::create_dir_all(task_dir.join("src/lib")).expect("src dir");
        fs::write(task_dir.join("src/index.js"), "module.exports = 1;\n").expect("index");
        fs::write(task_dir.join("src/lib/util.js"), [0u8, 159, 146, 150]).expect("util");
        task_dir
    }

    fn backup_dirs(task_dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(task_dir)
            .expect("read task dir")
            .map(|entry| entry.expect("entry").path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(BACKUP_PREFIX))
            })
            .collect()
    }

    #[test]
    fn snapshot_records_nested_files() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());

        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");
        let paths: Vec<&Path> = handle.manifest().keys().map(PathBuf::as_path).collect();
        assert_eq!(
            paths,
            vec![Path::new("index.js"), Path::new("lib/util.js")]
        );
        assert_eq!(handle.source_dir(), task_dir.join("src"));
        assert!(handle.backup_dir().join("lib/util.js").exists());
        assert_eq!(backup_dirs(&task_dir).len(), 1);
    }

    #[test]
    fn restore_undoes_edits_additions_and_deletions() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");

        fs::write(task_dir.join("src/index.js"), "broken").expect("edit");
        fs::remove_file(task_dir.join("src/lib/util.js")).expect("delete");
        fs::write(task_dir.join("src/new.js"), "untracked").expect("add");
        fs::create_dir_all(task_dir.join("src/cache/deep")).expect("add dir");
        fs::write(task_dir.join("src/cache/deep/x.bin"), "x").expect("add nested");
        assert!(handle.verify().is_err());

        handle.restore().expect("restore");

        assert_eq!(
            fs::read_to_string(task_dir.join("src/index.js")).expect("index"),
            "module.exports = 1;\n"
        );
        assert_eq!(
            fs::read(task_dir.join("src/lib/util.js")).expect("util"),
            vec![0u8, 159, 146, 150]
        );
        assert!(!task_dir.join("src/new.js").exists());
        assert!(!task_dir.join("src/cache").exists());
        handle.verify().expect("verify after restore");
    }

    #[test]
    fn restore_recreates_deleted_source_dir() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");

        fs::remove_dir_all(task_dir.join("src")).expect("rm src");
        handle.restore().expect("restore");
        assert!(task_dir.join("src/lib/util.js").exists());
    }

    #[test]
    fn restore_is_repeatable() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");

        for round in 0..3 {
            fs::write(task_dir.join("src/index.js"), format!("round {round}")).expect("edit");
            handle.restore().expect("restore");
            handle.verify().expect("verify");
        }
    }

    #[test]
    fn verify_reports_unexpected_file() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");

        fs::write(task_dir.join("src/extra.txt"), "x").expect("extra");
        let err = handle.verify().expect_err("extra file");
        assert!(err.to_string().contains("extra.txt"));
    }

    #[test]
    fn missing_source_dir_fails_without_leaving_backup() {
        let temp = tempdir().expect("tempdir");
        let task_dir = temp.path().join("task-404");
        fs::create_dir_all(&task_dir).expect("task dir");

        let err = SnapshotHandle::snapshot(&task_dir).expect_err("no src");
        assert!(err.to_string().contains("does not exist"));
        assert!(backup_dirs(&task_dir).is_empty());
    }

    #[test]
    fn discard_removes_backup() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");
        let backup = handle.backup_dir().to_path_buf();

        handle.discard().expect("discard");
        assert!(!backup.exists());
        assert!(task_dir.join("src/index.js").exists());
    }

    #[test]
    fn drop_without_discard_removes_backup() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let backup = {
            let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");
            handle.backup_dir().to_path_buf()
        };
        assert!(!backup.exists());
    }

    #[cfg(unix)]
    #[test]
    fn restore_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let script = task_dir.join("src/run.sh");
        fs::write(&script, "#!/bin/sh\nexit 0\n").expect("script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");

        fs::set_permissions(&script, fs::Permissions::from_mode(0o600)).expect("chmod");
        handle.restore().expect("restore");

        let mode = fs::metadata(&script).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_restored_as_links_and_cycles_are_not_followed() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        symlink("..", task_dir.join("src/lib/up")).expect("cycle link");
        symlink("index.js", task_dir.join("src/alias.js")).expect("file link");
        let handle = SnapshotHandle::snapshot(&task_dir).expect("snapshot");
        assert!(handle.manifest().contains_key(Path::new("lib/up")));
        assert!(!handle.manifest().contains_key(Path::new("lib/up/index.js")));

        fs::remove_file(task_dir.join("src/alias.js")).expect("rm link");
        symlink("lib/util.js", task_dir.join("src/alias.js")).expect("retarget");
        assert!(handle.verify().is_err());

        handle.restore().expect("restore");
        let alias = task_dir.join("src/alias.js");
        assert!(
            fs::symlink_metadata(&alias)
                .expect("alias")
                .file_type()
                .is_symlink()
        );
        assert_eq!(fs::read_link(&alias).expect("link"), PathBuf::from("index.js"));
        assert_eq!(fs::read_link(task_dir.join("src/lib/up")).expect("up"), PathBuf::from(".."));
    }

    #[test]
    fn digest_depends_only_on_contents() {
        let temp = tempdir().expect("tempdir");
        let task_dir = seed_task(temp.path());
        let first = SnapshotHandle::snapshot(&task_dir).expect("first");
        let second = SnapshotHandle::snapshot(&task_dir).expect("second");
        assert_ne!(first.backup_dir(), second.backup_dir());
        assert_eq!(first.digest(), second.digest());

        fs::write(task_dir.join("src/index.js"), "changed").expect("edit");
        let third = SnapshotHandle::snapshot(&task_dir).expect("third");
        assert_ne!(first.digest(), third.digest());
    }
}
