//! Per-batch build logs.
//!
//! Every batch gets a directory under the logs dir; every package of the
//! batch gets a subdirectory, and every step (`build`, `build-deps-install`,
//! ...) writes one `<step>.log` file there.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::util::fs::create_dirs;

/// Destination for command output that can name its own location for
/// error messages.
pub trait OutputSink: Write {
    fn location(&self) -> String;
}

#[derive(Debug)]
pub struct LogStore {
    id: String,
    path: PathBuf,
    tee: bool,
    logs: Vec<(String, PathBuf)>,
    subpackages: Vec<LogStore>,
}

impl LogStore {
    pub fn open(base: &Path, id: &str, tee: bool) -> Result<Self> {
        let path = base.join(id);
        create_dirs(&path)?;
        Ok(Self {
            id: id.to_string(),
            path,
            tee,
            logs: Vec::new(),
            subpackages: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output_handler(&mut self, name: &str) -> Result<OutputLog> {
        self.open_log(name, None)
    }

    /// Like [`output_handler`](Self::output_handler), recording every output
    /// line matching `trap`.
    pub fn trapping_handler(&mut self, name: &str, trap: &Regex) -> Result<OutputLog> {
        self.open_log(name, Some(trap.clone()))
    }

    fn open_log(&mut self, name: &str, trap: Option<Regex>) -> Result<OutputLog> {
        let path = self.path.join(format!("{name}.log"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log '{}'", path.display()))?;
        writeln!(file, "{BANNER} {name} started at {}", timestamp())
            .with_context(|| format!("writing to log '{}'", path.display()))?;
        self.logs.push((name.to_string(), path.clone()));
        Ok(OutputLog {
            file,
            name: name.to_string(),
            path,
            tee: self.tee,
            trap,
            matches: Vec::new(),
            pending: Vec::new(),
            line_start: true,
        })
    }

    /// Log store of one package within this batch.
    pub fn subpackage(&mut self, subid: &str) -> Result<&mut LogStore> {
        let sub = LogStore::open(&self.path, subid, self.tee)?;
        self.subpackages.push(sub);
        let last = self.subpackages.len() - 1;
        Ok(&mut self.subpackages[last])
    }

    /// Every log written under this store, as (relative name, path).
    pub fn logs(&self) -> Vec<(String, PathBuf)> {
        let mut all: Vec<(String, PathBuf)> = self
            .logs
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        for sub in &self.subpackages {
            for (name, path) in sub.logs() {
                all.push((format!("{}/{}", sub.id, name), path));
            }
        }
        all
    }
}

const BANNER: &str = ">>>>";

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339).unwrap_or_default()
}

/// Log file for one step.
#[derive(Debug)]
pub struct OutputLog {
    file: File,
    name: String,
    path: PathBuf,
    tee: bool,
    trap: Option<Regex>,
    matches: Vec<String>,
    pending: Vec<u8>,
    line_start: bool,
}

impl OutputLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that matched the trap expression so far.
    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    pub fn note(&mut self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())?;
        Ok(())
    }

    fn scan_lines(&mut self, final_flush: bool) {
        let Some(trap) = &self.trap else {
            self.pending.clear();
            return;
        };
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if trap.is_match(&line) {
                self.matches.push(line.trim_end().to_string());
            }
        }
        if final_flush && !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            if trap.is_match(&line) {
                self.matches.push(line.trim_end().to_string());
            }
            self.pending.clear();
        }
    }

    /// Finishes the log with the closing banner and returns the trapped
    /// lines.
    pub fn close(mut self) -> Result<Vec<String>> {
        self.scan_lines(true);
        let sep = if self.line_start { "" } else { "\n" };
        writeln!(self.file, "{sep}{BANNER} {} closed at {}", self.name, timestamp())?;
        self.file.flush()?;
        Ok(std::mem::take(&mut self.matches))
    }
}

impl Write for OutputLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file.write_all(buf)?;
        self.line_start = buf.ends_with(b"\n");
        if self.tee {
            let mut stdout = io::stdout();
            stdout.write_all(buf)?;
            stdout.flush()?;
        }
        if self.trap.is_some() {
            self.pending.extend_from_slice(buf);
            self.scan_lines(false);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl OutputSink for OutputLog {
    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Writes `content` through a temporary file and returns its path; used for
/// files that are copied into roots by the helper.
pub fn temp_file_with(content: &str) -> Result<tempfile::NamedTempFile> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_and_trap() {
        let tmp = TempDir::new().unwrap();
        let mut store = LogStore::open(tmp.path(), "2024.01.01.000000", false).unwrap();
        let trap = Regex::new("(No space left on device|cannot be installed)").unwrap();

        let sub = store.subpackage("foo-1.0-1").unwrap();
        let mut log = sub.trapping_handler("build-deps-install", &trap).unwrap();
        log.write_all(b"installing foo\nA requested package cannot ").unwrap();
        log.write_all(b"be installed\ndone").unwrap();
        let path = log.path().to_path_buf();
        let matches = log.close().unwrap();
        assert_eq!(matches, vec!["A requested package cannot be installed"]);
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with(">>>> build-deps-install started at "));
        assert_eq!(
            lines[1..4],
            ["installing foo", "A requested package cannot be installed", "done"]
        );
        assert!(lines[4].starts_with(">>>> build-deps-install closed at "));

        let mut plain = store.output_handler("chroot-install").unwrap();
        plain.note(">>>> note\n").unwrap();
        assert_eq!(plain.location(), tmp.path().join("2024.01.01.000000/chroot-install.log").display().to_string());

        let names: Vec<String> = store.logs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["chroot-install", "foo-1.0-1/build-deps-install"]);
    }
}
