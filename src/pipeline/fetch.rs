//! Fetch step: download and extract the upstream sources.
//!
//! Three inputs feed the image: the Alpine minirootfs, the kernel source
//! tarball, and (when the feature is on) the OpenZFS source. The kernel
//! version is resolved against kernel.org's release index with a short
//! timeout; a pinned fallback keeps offline and flaky-network runs
//! working. The resolved version is recorded in the working tree so the
//! later steps agree with whatever this run fetched.

use anyhow::{Context, Result};
use std::fs;
use std::time::Duration;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::environment::EnvironmentProfile;
use crate::preflight::command_exists;
use crate::process::Cmd;
use crate::strategy::extract::{extract, ExtractSpec};

pub const ALPINE_VERSION: &str = "3.20";
const ALPINE_PATCH: &str = "3.20.3";
const ZFS_VERSION: &str = "2.2.6";

const KERNEL_RELEASES_URL: &str = "https://www.kernel.org/releases.json";
/// Pinned longterm release used when the index probe fails.
const KERNEL_FALLBACK_VERSION: &str = "6.12.9";

const KERNEL_VERSION_FILENAME: &str = "kernel-version";

pub fn run(config: &Config, profile: &EnvironmentProfile, cache: &CacheManager) -> Result<()> {
    let kernel_version = resolve_kernel_version()?;
    fs::write(
        config.workdir.join(KERNEL_VERSION_FILENAME),
        format!("{}\n", kernel_version),
    )
    .context("recording kernel version")?;
    println!("  Kernel version: {}", kernel_version);

    let downloads = config.downloads_dir();
    let cache_opt = cache.enabled().then_some(cache);

    let alpine_url = format!(
        "https://dl-cdn.alpinelinux.org/alpine/v{}/releases/x86_64/alpine-minirootfs-{}-x86_64.tar.gz",
        ALPINE_VERSION, ALPINE_PATCH
    );
    let alpine = cache.get_or_fetch(&alpine_url, &downloads)?;
    extract(
        &ExtractSpec::new(&alpine, config.rootfs_dir()),
        profile,
        cache_opt,
    )?;

    let kernel_url = kernel_source_url(&kernel_version);
    let kernel = cache.get_or_fetch(&kernel_url, &downloads)?;
    extract(
        &ExtractSpec::new(&kernel, config.kernel_dir())
            .strip_components(1)
            .kernel_source(),
        profile,
        cache_opt,
    )?;

    if config.features.zfs {
        let zfs_url = format!(
            "https://github.com/openzfs/zfs/releases/download/zfs-{v}/zfs-{v}.tar.gz",
            v = ZFS_VERSION
        );
        let zfs = cache.get_or_fetch(&zfs_url, &downloads)?;
        extract(
            &ExtractSpec::new(&zfs, config.zfs_dir()).strip_components(1),
            profile,
            cache_opt,
        )?;
    }

    Ok(())
}

/// The kernel version this working tree fetched, recorded by the fetch
/// step and consumed by configure and build.
pub fn recorded_kernel_version(config: &Config) -> Result<String> {
    let path = config.workdir.join(KERNEL_VERSION_FILENAME);
    let text = fs::read_to_string(&path).with_context(|| {
        format!(
            "reading recorded kernel version '{}' (has the fetch step run?)",
            path.display()
        )
    })?;
    Ok(text.trim().to_string())
}

/// Ask kernel.org for the current longterm release, with a short timeout
/// so an unreachable index never stalls the pipeline.
fn resolve_kernel_version() -> Result<String> {
    if !command_exists("curl") {
        println!("  curl not found; using pinned kernel {}", KERNEL_FALLBACK_VERSION);
        return Ok(KERNEL_FALLBACK_VERSION.to_string());
    }

    let probe = Cmd::new("curl")
        .args(["-fsSL", "--max-time", "10", KERNEL_RELEASES_URL])
        .error_msg("kernel.org release index probe failed")
        .run_with_timeout(Duration::from_secs(15));

    match probe {
        Ok(out) => match latest_longterm(&out.stdout) {
            Some(version) => Ok(version),
            None => {
                eprintln!(
                    "  [WARN] could not parse kernel.org release index; using pinned kernel {}",
                    KERNEL_FALLBACK_VERSION
                );
                Ok(KERNEL_FALLBACK_VERSION.to_string())
            }
        },
        Err(e) => {
            eprintln!(
                "  [WARN] kernel.org unreachable ({}); using pinned kernel {}",
                e, KERNEL_FALLBACK_VERSION
            );
            Ok(KERNEL_FALLBACK_VERSION.to_string())
        }
    }
}

/// Tarball URL for a kernel version. The cdn groups releases by major
/// version ("v6.x"), so the directory is derived from the version itself
/// rather than pinned.
fn kernel_source_url(version: &str) -> String {
    let major = version.split('.').next().unwrap_or("6");
    format!(
        "https://cdn.kernel.org/pub/linux/kernel/v{}.x/linux-{}.tar.xz",
        major, version
    )
}

/// First longterm entry in a kernel.org releases.json document.
fn latest_longterm(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value
        .get("releases")?
        .as_array()?
        .iter()
        .find(|r| r.get("moniker").and_then(|m| m.as_str()) == Some("longterm"))
        .and_then(|r| r.get("version"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longterm_parsed_from_release_index() {
        let json = r#"{
            "releases": [
                {"moniker": "mainline", "version": "6.13-rc2"},
                {"moniker": "stable", "version": "6.12.9"},
                {"moniker": "longterm", "version": "6.6.68"},
                {"moniker": "longterm", "version": "6.1.124"}
            ]
        }"#;
        assert_eq!(latest_longterm(json), Some("6.6.68".to_string()));
    }

    #[test]
    fn kernel_url_follows_major_version() {
        assert_eq!(
            kernel_source_url("6.12.9"),
            "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.9.tar.xz"
        );
        assert_eq!(
            kernel_source_url("5.15.170"),
            "https://cdn.kernel.org/pub/linux/kernel/v5.x/linux-5.15.170.tar.xz"
        );
        assert_eq!(
            kernel_source_url("7.0"),
            "https://cdn.kernel.org/pub/linux/kernel/v7.x/linux-7.0.tar.xz"
        );
    }

    #[test]
    fn malformed_index_yields_none() {
        assert_eq!(latest_longterm("not json"), None);
        assert_eq!(latest_longterm("{}"), None);
        assert_eq!(latest_longterm(r#"{"releases": []}"#), None);
    }
}
