//! Bootable image assembly.
//!
//! The terminal artifact of the pipeline is a single bootable ISO:
//! the built kernel in `boot/`, the rootfs squashed into `live/`, glued
//! together by xorriso. All heavy lifting is external (mksquashfs,
//! xorriso, sha512sum); this module only sequences it.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

pub const ISO_BOOT_DIR: &str = "boot";
pub const ISO_LIVE_DIR: &str = "live";
pub const ISO_LABEL: &str = "RESCUE";

/// Create the ISO staging layout, clearing any previous build.
pub fn setup_iso_structure(iso_root: &Path) -> Result<()> {
    if iso_root.exists() {
        fs::remove_dir_all(iso_root)
            .with_context(|| format!("clearing previous ISO root '{}'", iso_root.display()))?;
    }
    fs::create_dir_all(iso_root.join(ISO_BOOT_DIR))?;
    fs::create_dir_all(iso_root.join(ISO_LIVE_DIR))?;
    Ok(())
}

/// Squash the rootfs into the live payload.
pub fn build_squashfs(rootfs: &Path, output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_file(output)?;
    }
    Cmd::new("mksquashfs")
        .arg_path(rootfs)
        .arg_path(output)
        .args(["-comp", "xz", "-noappend", "-quiet"])
        .error_msg("mksquashfs failed. Install squashfs-tools.")
        .run()?;
    Ok(())
}

/// Run xorriso to create the bootable ISO.
pub fn run_xorriso(iso_root: &Path, output: &Path, label: &str) -> Result<()> {
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-V", label])
        .args(["-J", "-joliet-long", "-rational-rock"])
        .arg_path(iso_root)
        .error_msg("xorriso failed. Install xorriso.")
        .run()?;
    Ok(())
}

/// Generate a SHA512 checksum file next to the ISO.
///
/// Writes the standard "<hash>  <filename>" format with just the
/// filename so users can verify with `sha512sum -c` from the output dir.
pub fn generate_iso_checksum(iso_path: &Path) -> Result<PathBuf> {
    let result = Cmd::new("sha512sum")
        .arg_path(iso_path)
        .error_msg("sha512sum failed. Install coreutils.")
        .run()?;

    let hash = result
        .stdout
        .split_whitespace()
        .next()
        .context("could not parse sha512sum output - no hash found")?;

    let filename = iso_path
        .file_name()
        .context("could not get ISO filename")?
        .to_string_lossy();

    let checksum_content = format!("{}  {}\n", hash, filename);
    let checksum_path = iso_path.with_extension("iso.sha512");
    fs::write(&checksum_path, &checksum_content)
        .with_context(|| format!("writing checksum '{}'", checksum_path.display()))?;

    if hash.len() >= 16 {
        println!("  SHA512: {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    }
    println!("  Wrote: {}", checksum_path.display());

    Ok(checksum_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_setup_iso_structure() {
        let temp = TempDir::new().unwrap();
        let iso_root = temp.path().join("iso-root");

        setup_iso_structure(&iso_root).unwrap();
        assert!(iso_root.join("boot").exists());
        assert!(iso_root.join("live").exists());

        // Re-running clears stale content.
        fs::write(iso_root.join("stale"), b"x").unwrap();
        setup_iso_structure(&iso_root).unwrap();
        assert!(!iso_root.join("stale").exists());
    }
}
