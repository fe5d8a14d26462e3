use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const PROC_MOUNTS: &str = "/proc/mounts";

pub fn mounted_paths() -> Result<BTreeSet<PathBuf>> {
    let raw = fs::read_to_string(PROC_MOUNTS)
        .with_context(|| format!("reading '{PROC_MOUNTS}'"))?;
    Ok(parse_mounts(&raw))
}

/// Mount points listed in a `/proc/mounts` style table, octal escapes
/// decoded.
pub fn parse_mounts(raw: &str) -> BTreeSet<PathBuf> {
    raw.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if bytes[i] == b'\\' && octal {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points at or below `path`, deepest first.
pub fn mounts_below(mounted: &BTreeSet<PathBuf>, path: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = mounted
        .iter()
        .filter(|m| m.starts_with(path))
        .cloned()
        .collect();
    found.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid 0 0
none /var/spool/jurt/chroots/active/a\\040b/proc proc rw 0 0
none /var/spool/jurt/chroots/active/a\\040b/dev/pts devpts rw 0 0
tmpfs /var/spool/jurt/chroots/tmpfs/t tmpfs rw 0 0
";

    #[test]
    fn test_parse_and_filter() {
        let mounted = parse_mounts(SAMPLE);
        assert!(mounted.contains(Path::new("/var/spool/jurt/chroots/active/a b/proc")));
        let below = mounts_below(&mounted, Path::new("/var/spool/jurt/chroots/active/a b"));
        assert_eq!(
            below,
            vec![
                PathBuf::from("/var/spool/jurt/chroots/active/a b/dev/pts"),
                PathBuf::from("/var/spool/jurt/chroots/active/a b/proc"),
            ]
        );
        assert!(mounts_below(&mounted, Path::new("/var/spool/jurt/chroots/old")).is_empty());
    }
}
