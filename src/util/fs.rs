//! Filesystem helpers shared by the controller and the agent.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn create_dirs(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating directory '{}'", path.display()))
}

/// Lexically normalizes an absolute path, resolving `.` and `..` without
/// touching the filesystem.
pub fn normalize(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        bail!("path must be absolute: '{}'", path.display());
    }
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Ok(out)
}

/// True when `path` lies strictly below `base` after normalization.
pub fn is_below(base: &Path, path: &Path) -> Result<bool> {
    let base = normalize(base)?;
    let path = normalize(path)?;
    Ok(path != base && path.starts_with(&base))
}

/// Resolves symlinks along the existing part of `path` and returns the real
/// path if it lies strictly below one of `bases`. Trailing components that
/// do not exist yet are appended as given.
pub fn resolve_below(bases: &[&Path], path: &Path) -> Result<Option<PathBuf>> {
    let path = normalize(path)?;
    let mut existing = path.as_path();
    let mut missing = Vec::new();
    while fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    let mut real = fs::canonicalize(existing)
        .with_context(|| format!("resolving '{}'", existing.display()))?;
    for name in missing.iter().rev() {
        real.push(name);
    }
    let inside = bases
        .iter()
        .filter_map(|base| fs::canonicalize(base).ok())
        .any(|base| real != base && real.starts_with(&base));
    Ok(inside.then_some(real))
}

/// Joins an in-root absolute path onto the root directory.
pub fn join_inside(root: &Path, inside: &str) -> PathBuf {
    root.join(inside.trim_start_matches('/'))
}

/// Device id of `path`, or of its nearest existing ancestor.
pub fn device_of(path: &Path) -> Result<u64> {
    let mut cur = path;
    loop {
        match fs::symlink_metadata(cur) {
            Ok(md) => return Ok(md.dev()),
            Err(_) => match cur.parent() {
                Some(parent) => cur = parent,
                None => bail!("no existing ancestor for '{}'", path.display()),
            },
        }
    }
}

pub fn same_partition(a: &Path, b: &Path) -> Result<bool> {
    Ok(device_of(a)? == device_of(b)?)
}

/// Points `link` at `target`, replacing an older symlink atomically.
///
/// A regular file or directory occupying the link path is renamed aside
/// with a timestamp suffix instead of being deleted.
pub fn replace_link(link: &Path, target: &Path) -> Result<()> {
    if let Ok(md) = fs::symlink_metadata(link) {
        if !md.file_type().is_symlink() {
            let aside = PathBuf::from(format!("{}.{}", link.display(), now_unix()));
            log::warn!(
                "'{}' is not a symlink, moving it to '{}'",
                link.display(),
                aside.display()
            );
            fs::rename(link, &aside)
                .with_context(|| format!("moving '{}' aside", link.display()))?;
        }
    }
    let tmp = PathBuf::from(format!("{}.tmp-{}", link.display(), std::process::id()));
    let _ = fs::remove_file(&tmp);
    symlink(target, &tmp).with_context(|| format!("creating symlink '{}'", tmp.display()))?;
    fs::rename(&tmp, link).with_context(|| format!("replacing symlink '{}'", link.display()))?;
    Ok(())
}

pub fn remove_link_if_exists(link: &Path) -> Result<bool> {
    match fs::symlink_metadata(link) {
        Ok(md) if md.file_type().is_symlink() => {
            fs::remove_file(link)
                .with_context(|| format!("removing symlink '{}'", link.display()))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if dest.exists() {
        let _ = fs::remove_file(dest);
    }

    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }

    fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

/// Recreates the tree at `src` under `dst`.
///
/// With `link_files` regular files are hard linked (both sides must share a
/// filesystem); otherwise they are copied. Symlinks are recreated as-is.
pub fn clone_tree(src: &Path, dst: &Path, link_files: bool) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
            let mode = entry.metadata()?.permissions();
            fs::set_permissions(&target, mode)?;
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("creating symlink '{}'", target.display()))?;
        } else if link_files {
            fs::hard_link(entry.path(), &target).with_context(|| {
                format!(
                    "linking '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Exclusive advisory lock held for the guard's lifetime.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock at `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // The lock file is never unlinked: removing a held lock file would let
        // a second process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            log::info!("waiting for lock {}", path.display());
            file.lock_exclusive()
                .with_context(|| format!("locking '{}'", path.display()))?;
        }
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_and_is_below() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")).unwrap(),
            PathBuf::from("/a/c/d")
        );
        assert!(normalize(Path::new("relative")).is_err());
        assert!(is_below(Path::new("/roots"), Path::new("/roots/active/x")).unwrap());
        assert!(!is_below(Path::new("/roots"), Path::new("/roots")).unwrap());
        assert!(!is_below(Path::new("/roots"), Path::new("/roots/../etc")).unwrap());
        assert!(!is_below(Path::new("/roots"), Path::new("/rootsX/a")).unwrap());
    }

    #[test]
    fn test_resolve_below_follows_links() {
        let tmp = TempDir::new().unwrap();
        let roots = tmp.path().join("roots");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(roots.join("r1")).unwrap();
        fs::create_dir_all(&outside).unwrap();
        symlink(&outside, roots.join("r1/out")).unwrap();
        symlink(roots.join("r1"), roots.join("r1/self")).unwrap();
        let real_roots = fs::canonicalize(&roots).unwrap();

        let fresh = resolve_below(&[roots.as_path()], &roots.join("r1/new/deeper")).unwrap();
        assert_eq!(fresh, Some(real_roots.join("r1/new/deeper")));
        let looped = resolve_below(&[roots.as_path()], &roots.join("r1/self/x")).unwrap();
        assert_eq!(looped, Some(real_roots.join("r1/x")));
        assert_eq!(resolve_below(&[roots.as_path()], &roots.join("r1/out")).unwrap(), None);
        assert_eq!(resolve_below(&[roots.as_path()], &roots.join("r1/out/a/b")).unwrap(), None);
        assert_eq!(resolve_below(&[roots.as_path()], &roots).unwrap(), None);
        assert_eq!(
            resolve_below(&[roots.as_path(), outside.as_path()], &roots.join("r1/out/a")).unwrap(),
            Some(fs::canonicalize(&outside).unwrap().join("a"))
        );
    }

    #[test]
    fn test_replace_link_moves_regular_file_aside() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("latest");
        fs::write(&link, "not a link").unwrap();

        replace_link(&link, Path::new("old/rel1")).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("old/rel1"));
        let aside: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("latest."))
            .collect();
        assert_eq!(aside.len(), 1);

        replace_link(&link, Path::new("active/rel1")).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("active/rel1"));
    }

    #[test]
    fn test_clone_tree_links_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/pkg.rpm"), "rpm").unwrap();
        symlink("sub/pkg.rpm", src.join("alias")).unwrap();

        let dst = tmp.path().join("dst");
        clone_tree(&src, &dst, true).unwrap();
        let a = fs::metadata(src.join("sub/pkg.rpm")).unwrap();
        let b = fs::metadata(dst.join("sub/pkg.rpm")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(
            fs::read_link(dst.join("alias")).unwrap(),
            PathBuf::from("sub/pkg.rpm")
        );
    }

    #[test]
    fn test_same_partition_for_missing_child() {
        let tmp = TempDir::new().unwrap();
        assert!(same_partition(tmp.path(), &tmp.path().join("does/not/exist")).unwrap());
    }
}
