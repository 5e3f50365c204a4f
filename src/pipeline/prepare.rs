//! Prepare step: host validation and working-tree layout.

use anyhow::{Context, Result};
use std::fs;

use crate::cache::CacheManager;
use crate::checkpoint::CHECKPOINT_FILENAME;
use crate::config::{Config, ReplayConfig};
use crate::environment::EnvironmentProfile;
use crate::preflight;
use crate::strategy::extract::forget_marker;

pub fn run(config: &Config, profile: &EnvironmentProfile, cache: &CacheManager) -> Result<()> {
    if config.clean_start {
        clean_working_tree(config)?;
    }

    preflight::check_host_tools()?;

    for dir in [
        config.workdir.clone(),
        config.downloads_dir(),
        config.out_dir(),
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating working directory '{}'", dir.display()))?;
    }

    println!(
        "  Host: {} (uid {}, sudo {})",
        profile.host.name(),
        profile.uid,
        if profile.has_sudo { "yes" } else { "no" }
    );
    if profile.is_ci {
        println!("  CI environment detected");
    }

    let replay = ReplayConfig::from_config(config).save(&config.workdir)?;
    println!("  Wrote run configuration: {}", replay.display());

    cache.setup_ccache()?;

    Ok(())
}

/// `--clean-start`: drop every intermediate from previous runs so the
/// pipeline starts from nothing but the cache.
fn clean_working_tree(config: &Config) -> Result<()> {
    println!("  Clean start: removing previous working tree");

    for dir in [
        config.downloads_dir(),
        config.rootfs_dir(),
        config.kernel_dir(),
        config.kernel_build_dir(),
        config.zfs_dir(),
        config.iso_dir(),
        config.out_dir(),
    ] {
        forget_marker(&dir)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("removing '{}'", dir.display()))?;
        }
    }

    let checkpoint = config.workdir.join(CHECKPOINT_FILENAME);
    if checkpoint.exists() {
        fs::remove_file(&checkpoint)
            .with_context(|| format!("removing stale checkpoint '{}'", checkpoint.display()))?;
    }

    Ok(())
}
