//! How fresh roots are produced. The strategy is picked by `root-type`.

use anyhow::Result;

use super::RootState;
use crate::config::TargetConfig;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStrategy {
    /// Populate every root from scratch through the package manager.
    Plain,
    /// Unpack a cached archive of a populated root, creating it first when
    /// missing.
    CompressedTemplate,
    /// Snapshot a btrfs subvolume holding a populated root.
    Snapshot,
    /// Populate a freshly mounted tmpfs, discarded on deactivation.
    Tmpfs,
}

pub type RootFactory = fn(&TargetConfig) -> Result<RootStrategy>;

pub fn standard_registry() -> Registry<RootFactory> {
    let mut reg: Registry<RootFactory> = Registry::new("root type");
    reg.register("chroot", |_| Ok(RootStrategy::Plain))
        .register("chroot-with-cache", |_| Ok(RootStrategy::CompressedTemplate))
        .register("chroot-with-btrfs", |_| Ok(RootStrategy::Snapshot))
        .register("chroot-tmpfs", |_| Ok(RootStrategy::Tmpfs));
    reg
}

impl RootStrategy {
    /// State directories the strategy needs to exist.
    pub fn required_states(self) -> &'static [RootState] {
        match self {
            RootStrategy::Tmpfs => &[RootState::Tmpfs],
            _ => &[RootState::Temp, RootState::Active, RootState::Old, RootState::Keep],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        let reg = standard_registry();
        assert_eq!(
            reg.names(),
            vec!["chroot", "chroot-tmpfs", "chroot-with-btrfs", "chroot-with-cache"]
        );
        assert!(reg.get("chroot-with-zfs").is_err());
    }
}
