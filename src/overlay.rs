//! Kernel configuration overlay merging.
//!
//! A resolved kernel config is a left-fold: start from the base config,
//! then for each enabled feature (in the fixed order of `Feature::ALL`)
//! append its patch's option lines, with later assignments for a key
//! shadowing earlier ones. Both `CONFIG_X=y` and `# CONFIG_X is not set`
//! count as assignments to `CONFIG_X`. The fold output still needs
//! `make olddefconfig` to resolve unset options to their defaults; that
//! normalization runs in the configure step against the kernel tree.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Feature, FeatureSet};
use crate::process::Cmd;

/// Extract the option key from a kconfig line, covering both the
/// assignment and the "is not set" comment forms.
fn option_key(line: &str) -> Option<&str> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("# ") {
        if let Some(key) = rest.strip_suffix(" is not set") {
            if key.starts_with("CONFIG_") {
                return Some(key);
            }
        }
        return None;
    }
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    line.split_once('=').map(|(key, _)| key.trim())
}

/// Apply one patch's option lines onto the accumulated config.
///
/// Later assignments win: any prior line for the same key (either form)
/// is dropped before the new line is appended.
pub fn apply_patch(config: &str, patch: &str) -> String {
    let mut lines: Vec<String> = config.lines().map(str::to_string).collect();

    for patch_line in patch.lines() {
        let Some(key) = option_key(patch_line) else {
            continue;
        };
        let assign_prefix = format!("{}=", key);
        let not_set = format!("# {} is not set", key);
        lines.retain(|l| {
            let t = l.trim();
            !t.starts_with(&assign_prefix) && t != not_set
        });
        lines.push(patch_line.trim().to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Merge the base config with every enabled feature's patch.
///
/// A missing patch file is logged and skipped unless the feature is in
/// `required`, in which case the merge fails.
pub fn merge(
    base: &Path,
    kconfig_dir: &Path,
    features: &FeatureSet,
    required: &[Feature],
    out: &Path,
) -> Result<PathBuf> {
    let mut config = fs::read_to_string(base)
        .with_context(|| format!("reading base kernel config '{}'", base.display()))?;

    for feature in features.enabled() {
        let patch_path = kconfig_dir.join(feature.patch_filename());
        if !patch_path.is_file() {
            if required.contains(&feature) {
                bail!(
                    "required feature '{}' has no config patch at {}",
                    feature.name(),
                    patch_path.display()
                );
            }
            eprintln!(
                "  [WARN] no config patch for feature '{}' (looked in {}); skipping",
                feature.name(),
                patch_path.display()
            );
            continue;
        }
        let patch = fs::read_to_string(&patch_path)
            .with_context(|| format!("reading config patch '{}'", patch_path.display()))?;
        println!("  Applying feature overlay: {}", feature.name());
        config = apply_patch(&config, &patch);
    }

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, &config)
        .with_context(|| format!("writing resolved kernel config '{}'", out.display()))?;
    Ok(out.to_path_buf())
}

/// Fingerprint of a resolved config, used to skip redundant reconfigures.
pub fn fingerprint(config: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize the resolved config against the kernel tree.
///
/// `make olddefconfig` accepts the kernel's default resolution for every
/// option the overlays did not set, so the output is always a complete,
/// internally consistent configuration.
pub fn normalize(kernel_src: &Path, build_dir: &Path) -> Result<()> {
    Cmd::new("make")
        .args(["-C", &kernel_src.to_string_lossy()])
        .arg(format!("O={}", build_dir.display()))
        .arg("olddefconfig")
        .error_msg("make olddefconfig failed")
        .run()?;
    Ok(())
}
