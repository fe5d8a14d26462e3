//! Directory layout under the roots path and the per-user latest links.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{LatestTarget, RootState};
use crate::error::Error;
use crate::util::fs::{remove_link_if_exists, replace_link};

#[derive(Debug, Clone)]
pub struct RootsLayout {
    top: PathBuf,
    user: String,
    build_suffix: String,
    interactive_suffix: String,
}

impl RootsLayout {
    pub fn new(
        top: impl Into<PathBuf>,
        user: impl Into<String>,
        build_suffix: impl Into<String>,
        interactive_suffix: impl Into<String>,
    ) -> Self {
        Self {
            top: top.into(),
            user: user.into(),
            build_suffix: build_suffix.into(),
            interactive_suffix: interactive_suffix.into(),
        }
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    pub fn state_dir(&self, state: RootState) -> PathBuf {
        self.top.join(state.dir_name())
    }

    pub fn root_path(&self, state: RootState, name: &str) -> PathBuf {
        self.state_dir(state).join(name)
    }

    pub fn latest_link(&self, interactive: bool) -> PathBuf {
        let suffix = if interactive {
            &self.interactive_suffix
        } else {
            &self.build_suffix
        };
        self.top.join(format!("{}{}", self.user, suffix))
    }

    /// Target recorded by the latest link, `None` when there is no link.
    pub fn read_latest(&self, interactive: bool) -> Result<Option<LatestTarget>> {
        let link = self.latest_link(interactive);
        match fs::read_link(&link) {
            Ok(target) => Ok(Some(LatestTarget::parse(&target)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading link '{}'", link.display())),
        }
    }

    /// Root the latest link points at, which must exist.
    pub fn resolve_latest(&self, interactive: bool) -> Result<(LatestTarget, PathBuf)> {
        let link = self.latest_link(interactive);
        let target = self.read_latest(interactive)?.ok_or_else(|| {
            Error::RootState(format!("no latest root recorded at '{}'", link.display()))
        })?;
        let path = self.root_path(target.state, &target.name);
        if !path.exists() {
            return Err(Error::RootState(format!(
                "latest link '{}' points to a missing root: {}",
                link.display(),
                path.display()
            ))
            .into());
        }
        Ok((target, path))
    }

    pub fn update_latest(&self, interactive: bool, state: RootState, name: &str) -> Result<()> {
        let target = LatestTarget::new(state, name);
        replace_link(&self.latest_link(interactive), &target.link_target())
    }

    /// Removes the latest links (both modes) that point at `state/name`.
    pub fn clear_latest_if(&self, state: RootState, name: &str) -> Result<()> {
        let wanted = LatestTarget::new(state, name);
        for interactive in [false, true] {
            // A malformed link is not ours to repair here.
            if let Ok(Some(current)) = self.read_latest(interactive) {
                if current == wanted {
                    remove_link_if_exists(&self.latest_link(interactive))?;
                }
            }
        }
        Ok(())
    }

    /// First state (in lookup order) holding a root called `name`.
    pub fn find(&self, name: &str) -> Option<(RootState, PathBuf)> {
        RootState::LOOKUP_ORDER.into_iter().find_map(|state| {
            let path = self.root_path(state, name);
            path.is_dir().then_some((state, path))
        })
    }

    /// Every well-formed latest link under the roots path, for any user.
    pub fn all_latest_targets(&self) -> Result<Vec<LatestTarget>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.top) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => {
                return Err(e).with_context(|| format!("reading '{}'", self.top.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.ends_with(&self.build_suffix) || name.ends_with(&self.interactive_suffix)) {
                continue;
            }
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Ok(parsed) = LatestTarget::parse(&target) {
                    found.push(parsed);
                }
            }
        }
        Ok(found)
    }

    /// Names of the roots present in one state directory.
    pub fn roots_in(&self, state: RootState) -> Result<Vec<String>> {
        let dir = self.state_dir(state);
        let mut names = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("reading '{}'", dir.display())),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Roots in the active, keep and old states.
    pub fn list_roots(&self) -> Result<Vec<(RootState, String)>> {
        let mut all = Vec::new();
        for state in [RootState::Active, RootState::Keep, RootState::Old] {
            all.extend(self.roots_in(state)?.into_iter().map(|name| (state, name)));
        }
        Ok(all)
    }

    pub fn check_state_dirs(&self, states: &[RootState]) -> Result<()> {
        for state in states {
            let dir = self.state_dir(*state);
            if !dir.is_dir() {
                return Err(Error::Setup(format!(
                    "root state directory '{}' is missing, run jurt-setup",
                    dir.display()
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn layout(tmp: &TempDir) -> RootsLayout {
        RootsLayout::new(tmp.path(), "alice", "-build-latest", "-interactive-latest")
    }

    #[test]
    fn test_latest_link_cycle() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        fs::create_dir_all(layout.root_path(RootState::Active, "rel1")).unwrap();

        assert_eq!(layout.read_latest(false).unwrap(), None);
        layout.update_latest(false, RootState::Active, "rel1").unwrap();
        assert_eq!(
            fs::read_link(tmp.path().join("alice-build-latest")).unwrap(),
            PathBuf::from("active/rel1")
        );
        let (target, path) = layout.resolve_latest(false).unwrap();
        assert_eq!(target, LatestTarget::new(RootState::Active, "rel1"));
        assert_eq!(path, layout.root_path(RootState::Active, "rel1"));

        layout.clear_latest_if(RootState::Old, "rel1").unwrap();
        assert!(layout.read_latest(false).unwrap().is_some());
        layout.clear_latest_if(RootState::Active, "rel1").unwrap();
        assert!(layout.read_latest(false).unwrap().is_none());
    }

    #[test]
    fn test_malformed_and_dangling_links() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        symlink("/etc", layout.latest_link(true)).unwrap();
        assert!(layout.read_latest(true).is_err());

        layout.update_latest(false, RootState::Old, "gone").unwrap();
        let err = layout.resolve_latest(false).unwrap_err();
        assert!(err.to_string().contains("missing root"));
    }

    #[test]
    fn test_find_prefers_active_then_keep() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        fs::create_dir_all(layout.root_path(RootState::Old, "r")).unwrap();
        assert_eq!(layout.find("r").unwrap().0, RootState::Old);
        fs::create_dir_all(layout.root_path(RootState::Keep, "r")).unwrap();
        assert_eq!(layout.find("r").unwrap().0, RootState::Keep);
        fs::create_dir_all(layout.root_path(RootState::Active, "r")).unwrap();
        assert_eq!(layout.find("r").unwrap().0, RootState::Active);
        assert!(layout.find("other").is_none());
    }

    #[test]
    fn test_all_latest_targets_skips_foreign_links() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.update_latest(false, RootState::Old, "a").unwrap();
        let bob = RootsLayout::new(tmp.path(), "bob", "-build-latest", "-interactive-latest");
        bob.update_latest(true, RootState::Keep, "b").unwrap();
        symlink("old/c", tmp.path().join("unrelated")).unwrap();

        let mut found = layout.all_latest_targets().unwrap();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            found,
            vec![
                LatestTarget::new(RootState::Old, "a"),
                LatestTarget::new(RootState::Keep, "b"),
            ]
        );
    }
}
