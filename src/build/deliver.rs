//! Assembles a finished batch under the delivery directory:
//!
//! ```text
//! <delivery>/<id>/batch.json
//! <delivery>/<id>/<source-id>/logs/<step>.log.zst
//! <delivery>/<id>/<source-id>/packages/<file>
//! <delivery>/latest -> <id>
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::result::BuildResult;
use crate::config::TargetConfig;
use crate::logstore::LogStore;
use crate::util::fs::{create_dirs, hardlink_or_copy, replace_link};

const MANIFEST: &str = "batch.json";

#[derive(Serialize)]
struct Manifest<'a> {
    id: &'a str,
    time: String,
    results: &'a [BuildResult],
}

/// Copies compressed logs and the collected packages of a batch into the
/// delivery tree. Returns the batch's delivery directory.
pub fn deliver(
    cfg: &TargetConfig,
    id: &str,
    results: &[BuildResult],
    logs: &LogStore,
) -> Result<PathBuf> {
    let base = cfg.delivery_path();
    let top = base.join(id);
    create_dirs(&top)?;

    for (name, path) in logs.logs() {
        let owner = match name.split_once('/') {
            Some((subid, _)) => top.join(subid),
            None => top.clone(),
        };
        let dir = owner.join(&cfg.logs_dir_name);
        create_dirs(&dir)?;
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let dest = dir.join(format!(
            "{}{}",
            file_name.to_string_lossy(),
            cfg.delivery_log_file_ext
        ));
        compress_log(&path, &dest, cfg.log_compress_level)?;
    }

    for result in results {
        let dir = top.join(&result.source_id).join(&cfg.packages_dir_name);
        for artifact in &result.artifacts {
            let Some(name) = artifact.file_name() else {
                continue;
            };
            log::debug!("delivering {}", artifact.display());
            hardlink_or_copy(artifact, &dir.join(name))?;
        }
    }

    write_manifest(&top.join(MANIFEST), id, results)?;

    if results.iter().all(|r| r.success) {
        replace_link(&base.join(&cfg.latest_link_name), Path::new(id))?;
    } else {
        log::debug!("batch {id} had failures, not moving {}", cfg.latest_link_name);
    }
    Ok(top)
}

fn compress_log(src: &Path, dest: &Path, level: i32) -> Result<()> {
    let input = File::open(src).with_context(|| format!("opening log '{}'", src.display()))?;
    let output =
        File::create(dest).with_context(|| format!("creating '{}'", dest.display()))?;
    zstd::stream::copy_encode(input, output, level)
        .with_context(|| format!("compressing '{}'", src.display()))
}

fn write_manifest(path: &Path, id: &str, results: &[BuildResult]) -> Result<()> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let manifest = Manifest {
        id,
        time: now.format(&Rfc3339)?,
        results,
    };
    let payload = serde_json::to_vec_pretty(&manifest).context("serializing batch manifest")?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, payload).with_context(|| format!("writing '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("writing '{}'", path.display()))
}
