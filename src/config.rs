//! Run configuration.
//!
//! All CLI flags and feature environment variables are resolved once at
//! startup into an immutable `Config` that is threaded through every
//! component. No component reads the ambient process environment after
//! this point (the environment classifier excepted).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const REPLAY_FILENAME: &str = "rescue-builder.toml";

/// Optional feature sets merged into the base kernel configuration and
/// installed into the rootfs. Order here is the fixed, deterministic
/// overlay application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Zfs,
    Btrfs,
    RecoveryTools,
    NetworkTools,
    Crypto,
    Tui,
    Compression,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::Zfs,
        Feature::Btrfs,
        Feature::RecoveryTools,
        Feature::NetworkTools,
        Feature::Crypto,
        Feature::Tui,
        Feature::Compression,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Feature::Zfs => "zfs",
            Feature::Btrfs => "btrfs",
            Feature::RecoveryTools => "recovery-tools",
            Feature::NetworkTools => "network-tools",
            Feature::Crypto => "crypto",
            Feature::Tui => "tui",
            Feature::Compression => "compression",
        }
    }

    /// Kernel config overlay patch file for this feature.
    pub fn patch_filename(&self) -> &'static str {
        match self {
            Feature::Zfs => "zfs.conf",
            Feature::Btrfs => "btrfs.conf",
            Feature::RecoveryTools => "recovery-tools.conf",
            Feature::NetworkTools => "network-tools.conf",
            Feature::Crypto => "crypto.conf",
            Feature::Tui => "tui.conf",
            Feature::Compression => "compression.conf",
        }
    }

    /// Alpine packages installed into the rootfs for this feature.
    pub fn rootfs_packages(&self) -> &'static [&'static str] {
        match self {
            // ZFS userland is built from source against the built kernel.
            Feature::Zfs => &[],
            Feature::Btrfs => &["btrfs-progs"],
            Feature::RecoveryTools => &["testdisk", "ddrescue", "smartmontools", "hdparm"],
            Feature::NetworkTools => &["openssh", "rsync", "curl", "tcpdump"],
            Feature::Crypto => &["cryptsetup", "lvm2", "mdadm"],
            Feature::Tui => &["ncurses", "dialog"],
            // Compression runs host-side (upx over image binaries).
            Feature::Compression => &[],
        }
    }
}

/// Which optional features this run builds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub zfs: bool,
    pub btrfs: bool,
    pub recovery_tools: bool,
    pub network_tools: bool,
    pub crypto: bool,
    pub tui: bool,
    pub compression: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            zfs: true,
            btrfs: true,
            recovery_tools: true,
            network_tools: true,
            crypto: true,
            tui: true,
            compression: false,
        }
    }
}

impl FeatureSet {
    /// Everything off; the `--minimal` kernel.
    pub fn minimal() -> Self {
        Self {
            zfs: false,
            btrfs: false,
            recovery_tools: false,
            network_tools: false,
            crypto: false,
            tui: false,
            compression: false,
        }
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::Zfs => self.zfs,
            Feature::Btrfs => self.btrfs,
            Feature::RecoveryTools => self.recovery_tools,
            Feature::NetworkTools => self.network_tools,
            Feature::Crypto => self.crypto,
            Feature::Tui => self.tui,
            Feature::Compression => self.compression,
        }
    }

    /// Enabled features in the fixed application order.
    pub fn enabled(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.is_enabled(*f))
            .collect()
    }
}

/// Root password policy for the produced image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPolicy {
    /// Caller-supplied password.
    Explicit(String),
    /// Generate a password and write it to a readable file in out/.
    Generate,
    /// Lock the root account (console-only recovery image).
    LockRoot,
}

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct Config {
    pub workdir: PathBuf,
    pub cache_dir: PathBuf,
    pub kconfig_dir: PathBuf,
    pub features: FeatureSet,
    pub jobs: Option<usize>,
    pub use_swap: bool,
    pub use_cache: bool,
    pub verbose: bool,
    pub clean_start: bool,
    pub clean_end: bool,
    pub skip_prepare: bool,
    pub password: PasswordPolicy,
}

impl Config {
    pub fn downloads_dir(&self) -> PathBuf {
        self.workdir.join("downloads")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.workdir.join("rootfs")
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.workdir.join("kernel")
    }

    /// Out-of-tree kernel build directory (`make O=`).
    pub fn kernel_build_dir(&self) -> PathBuf {
        self.workdir.join("kernel-build")
    }

    pub fn zfs_dir(&self) -> PathBuf {
        self.workdir.join("zfs")
    }

    /// ISO staging layout assembled by the build step.
    pub fn iso_dir(&self) -> PathBuf {
        self.workdir.join("iso")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.workdir.join("out")
    }

    /// Default cache directory (`~/.cache/rescue-builder`).
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("rescue-builder")
    }
}

/// The replayable subset of the flag set, persisted so a later invocation
/// can reproduce the last run's feature selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub features: FeatureSet,
    pub jobs: Option<usize>,
    pub use_swap: bool,
    pub use_cache: bool,
}

impl ReplayConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            features: config.features,
            jobs: config.jobs,
            use_swap: config.use_swap,
            use_cache: config.use_cache,
        }
    }

    pub fn save(&self, workdir: &Path) -> Result<PathBuf> {
        let path = workdir.join(REPLAY_FILENAME);
        let text = toml::to_string_pretty(self).context("serializing replay config")?;
        fs::write(&path, text)
            .with_context(|| format!("writing replay config '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(workdir: &Path) -> Result<Option<Self>> {
        let path = workdir.join(REPLAY_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading replay config '{}'", path.display()))?;
        let parsed = toml::from_str(&text)
            .with_context(|| format!("parsing replay config '{}'", path.display()))?;
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_disables_every_feature() {
        let features = FeatureSet::minimal();
        for feature in Feature::ALL {
            assert!(!features.is_enabled(feature), "{} enabled", feature.name());
        }
        assert!(features.enabled().is_empty());
    }

    #[test]
    fn enabled_preserves_fixed_order() {
        let features = FeatureSet::default();
        let enabled = features.enabled();
        // Default has compression off, everything else on.
        assert_eq!(enabled.len(), 6);
        assert_eq!(enabled[0], Feature::Zfs);
        assert_eq!(enabled[1], Feature::Btrfs);
        assert_eq!(*enabled.last().unwrap(), Feature::Tui);
    }

    #[test]
    fn replay_config_round_trips() {
        let tmp = TempDir::new().unwrap();
        let replay = ReplayConfig {
            features: FeatureSet::minimal(),
            jobs: Some(4),
            use_swap: true,
            use_cache: false,
        };
        replay.save(tmp.path()).unwrap();
        let loaded = ReplayConfig::load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded, replay);
    }

    #[test]
    fn replay_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(ReplayConfig::load(tmp.path()).unwrap().is_none());
    }
}
