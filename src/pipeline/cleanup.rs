//! Cleanup step: release transient resources and reset pipeline state.
//!
//! Always safe to run, even after a crash: leftover swap files from an
//! interrupted build are swept, extraction markers are dropped so the
//! next run re-extracts, and the checkpoint is cleared. `--clean-end`
//! additionally removes the intermediate trees, keeping only `out/`.

use anyhow::{Context, Result};
use std::fs;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::environment::EnvironmentProfile;
use crate::resources::{release_swap_file, SWAP_FILENAME};
use crate::strategy::extract::forget_marker;

pub fn run(
    config: &Config,
    profile: &EnvironmentProfile,
    checkpoints: &CheckpointStore,
) -> Result<()> {
    let swap = config.workdir.join(SWAP_FILENAME);
    if swap.exists() {
        println!("  Releasing leftover swap file");
        release_swap_file(&swap, profile.has_sudo && !profile.is_root());
    }

    for dir in [config.rootfs_dir(), config.kernel_dir(), config.zfs_dir()] {
        forget_marker(&dir)?;
    }

    if config.clean_end {
        println!("  Removing intermediate trees (keeping out/)");
        for dir in [
            config.downloads_dir(),
            config.rootfs_dir(),
            config.kernel_dir(),
            config.kernel_build_dir(),
            config.zfs_dir(),
            config.iso_dir(),
            config.workdir.join("initramfs"),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("removing '{}'", dir.display()))?;
            }
        }
    }

    checkpoints.clear()?;
    println!("  Pipeline state reset");
    Ok(())
}
