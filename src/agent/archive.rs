//! Root templates stored as zstd-compressed tarballs with a sha256 sidecar.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::util::fs::sha256_file;

const COMPRESS_LEVEL: i32 = 3;

pub fn checksum_path(archive: &Path) -> PathBuf {
    PathBuf::from(format!("{}.sha256", archive.display()))
}

/// Archives the whole tree under `root` into `archive`.
///
/// The archive is written next to its destination and renamed into place
/// once its checksum file exists, so readers never see a partial template.
pub fn compress_tree(root: &Path, archive: &Path) -> Result<()> {
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    ));

    let out = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
    let encoder = zstd::stream::Encoder::new(out, COMPRESS_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);
    builder.follow_symlinks(false);

    // Collect paths deterministically.
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(root).follow_links(false) {
        let ent = ent.with_context(|| format!("walking '{}'", root.display()))?;
        if ent.path() == root {
            continue;
        }
        entries.push(ent.into_path());
    }
    entries.sort();

    for path in entries {
        let rel = path.strip_prefix(root)?;
        builder
            .append_path_with_name(&path, rel)
            .with_context(|| format!("archiving '{}'", path.display()))?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;

    let sum = sha256_file(&tmp)?;
    fs::write(checksum_path(archive), format!("{sum}\n"))?;
    fs::rename(&tmp, archive).with_context(|| {
        format!("Failed to move {} to {}", tmp.display(), archive.display())
    })?;
    Ok(())
}

/// Unpacks `archive` into `root` after verifying its checksum, preserving
/// ownership and permissions.
pub fn decompress_tree(archive: &Path, root: &Path) -> Result<()> {
    let sidecar = checksum_path(archive);
    let expected = fs::read_to_string(&sidecar)
        .with_context(|| format!("reading checksum '{}'", sidecar.display()))?;
    let actual = sha256_file(archive)?;
    if expected.trim() != actual {
        bail!(
            "checksum mismatch for template '{}': expected {}, got {}",
            archive.display(),
            expected.trim(),
            actual
        );
    }

    fs::create_dir_all(root)?;
    let f = File::open(archive)?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut tarball = tar::Archive::new(decoder);
    tarball.set_preserve_permissions(true);
    tarball.set_preserve_ownerships(crate::util::is_root());
    tarball.set_preserve_mtime(true);
    tarball.set_overwrite(true);
    tarball
        .unpack(root)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    Ok(())
}
