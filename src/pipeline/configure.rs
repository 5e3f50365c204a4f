//! Configure step: resolve and normalize the kernel configuration.
//!
//! The resolved config is the base overlay plus one patch per enabled
//! feature, merged last-writer-wins, then normalized by `make
//! olddefconfig` against the fetched tree. A fingerprint of the resolved
//! overlay is stored next to the generated `.config`; when neither the
//! overlay nor the tree changed, the whole step is a skip.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, Feature};
use crate::overlay;
use crate::process::{ensure_exists, Cmd};
use crate::resources::ResourcePlanner;

const FINGERPRINT_FILENAME: &str = ".config.fingerprint";

/// Built-in overlay set, materialized when no kconfig directory is
/// supplied. Keeping them embedded means the binary is self-contained.
const DEFAULT_KCONFIGS: &[(&str, &str)] = &[
    ("base.conf", include_str!("../../config/kconfig/base.conf")),
    ("zfs.conf", include_str!("../../config/kconfig/zfs.conf")),
    ("btrfs.conf", include_str!("../../config/kconfig/btrfs.conf")),
    (
        "recovery-tools.conf",
        include_str!("../../config/kconfig/recovery-tools.conf"),
    ),
    (
        "network-tools.conf",
        include_str!("../../config/kconfig/network-tools.conf"),
    ),
    ("crypto.conf", include_str!("../../config/kconfig/crypto.conf")),
    ("tui.conf", include_str!("../../config/kconfig/tui.conf")),
    (
        "compression.conf",
        include_str!("../../config/kconfig/compression.conf"),
    ),
];

pub fn run(config: &Config, planner: &ResourcePlanner) -> Result<()> {
    let kernel_src = config.kernel_dir();
    ensure_exists(&kernel_src.join("Makefile"), "kernel source (run the fetch step first)")?;

    let build_dir = config.kernel_build_dir();
    fs::create_dir_all(&build_dir)
        .with_context(|| format!("creating kernel build dir '{}'", build_dir.display()))?;

    let kconfig_dir = resolve_kconfig_dir(config)?;

    // ZFS kernel options are load-bearing when the feature is on; the
    // other overlays only add tooling support.
    let required = if config.features.zfs {
        vec![Feature::Zfs]
    } else {
        Vec::new()
    };
    let resolved = config.workdir.join("resolved.config");
    overlay::merge(
        &kconfig_dir.join("base.conf"),
        &kconfig_dir,
        &config.features,
        &required,
        &resolved,
    )?;

    let resolved_text = fs::read_to_string(&resolved)?;
    let fingerprint = overlay::fingerprint(&resolved_text);
    let fingerprint_path = build_dir.join(FINGERPRINT_FILENAME);
    if build_dir.join(".config").exists()
        && fs::read_to_string(&fingerprint_path)
            .map(|f| f.trim() == fingerprint)
            .unwrap_or(false)
    {
        println!("  [SKIP] kernel config unchanged");
        return Ok(());
    }

    println!("  Generating kernel config (defconfig + overlays)");
    Cmd::new("make")
        .args(["-C", &kernel_src.to_string_lossy()])
        .arg(format!("O={}", build_dir.display()))
        .arg("defconfig")
        .error_msg("make defconfig failed")
        .run()?;

    let dot_config = build_dir.join(".config");
    let generated = fs::read_to_string(&dot_config)
        .with_context(|| format!("reading '{}'", dot_config.display()))?;
    fs::write(&dot_config, overlay::apply_patch(&generated, &resolved_text))
        .with_context(|| format!("writing '{}'", dot_config.display()))?;

    overlay::normalize(&kernel_src, &build_dir)?;
    fs::write(&fingerprint_path, &fingerprint)
        .with_context(|| format!("writing '{}'", fingerprint_path.display()))?;

    let plan = planner.plan()?;
    println!(
        "  Build plan: {} threads, flags '{}'{}",
        plan.thread_count,
        plan.compiler_flags,
        if plan.use_swap { ", swap" } else { "" }
    );

    Ok(())
}

/// Use the configured overlay directory when it holds a base config;
/// otherwise materialize the built-in set into the working tree.
fn resolve_kconfig_dir(config: &Config) -> Result<PathBuf> {
    if config.kconfig_dir.join("base.conf").is_file() {
        return Ok(config.kconfig_dir.clone());
    }

    let dir = config.workdir.join("kconfig");
    materialize_default_kconfigs(&dir)?;
    Ok(dir)
}

fn materialize_default_kconfigs(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating kconfig dir '{}'", dir.display()))?;
    for (name, content) in DEFAULT_KCONFIGS {
        let path = dir.join(name);
        if !path.exists() {
            fs::write(&path, content)
                .with_context(|| format!("writing '{}'", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Feature;
    use tempfile::TempDir;

    #[test]
    fn default_kconfigs_cover_every_feature() {
        let names: Vec<&str> = DEFAULT_KCONFIGS.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"base.conf"));
        for feature in Feature::ALL {
            assert!(
                names.contains(&feature.patch_filename()),
                "missing overlay for {}",
                feature.name()
            );
        }
    }

    #[test]
    fn materialize_writes_once_and_preserves_edits() {
        let tmp = TempDir::new().unwrap();
        materialize_default_kconfigs(tmp.path()).unwrap();
        assert!(tmp.path().join("base.conf").is_file());

        fs::write(tmp.path().join("base.conf"), "CONFIG_CUSTOM=y\n").unwrap();
        materialize_default_kconfigs(tmp.path()).unwrap();
        let content = fs::read_to_string(tmp.path().join("base.conf")).unwrap();
        assert_eq!(content, "CONFIG_CUSTOM=y\n");
    }
}
