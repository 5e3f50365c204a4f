//! Archive extraction with a layered fallback chain.
//!
//! Extraction is the most environment-sensitive operation in the
//! pipeline: parallel decompressors may or may not be installed,
//! container overlay filesystems choke on ownership restoration, and
//! permission failures sometimes need an elevated retry. The chain for a
//! container profile is:
//!
//! 1. parallel decompressor (pigz/pixz/pzstd) when present
//! 2. plain sequential tar
//! 3. cached pre-extracted snapshot (when the content cache is enabled)
//! 4. maximally-compatible slow extraction (no ownership, no privileges)
//! 5. sudo-elevated retry (only when sudo exists)
//!
//! Bare hosts collapse to direct extraction plus the elevated retry.
//! Every completed extraction writes a JSON marker next to the target
//! directory; a present marker makes the whole operation a no-op.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::cache::CacheManager;
use crate::environment::EnvironmentProfile;
use crate::preflight::command_exists;
use crate::process::Cmd;
use crate::strategy::{try_strategies, Operation, Strategy, StrategyKind};

/// One extraction request.
#[derive(Debug, Clone)]
pub struct ExtractSpec {
    pub archive: PathBuf,
    pub dest: PathBuf,
    /// Leading path components to strip (1 for kernel-style tarballs with
    /// a single top-level directory).
    pub strip_components: u32,
    /// Kernel source trees get the specialized strategy: ownership
    /// normalization over hundreds of thousands of files is prohibitively
    /// slow, so only the build-critical executable bits are restored.
    pub kernel_source: bool,
}

impl ExtractSpec {
    pub fn new(archive: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            dest: dest.into(),
            strip_components: 0,
            kernel_source: false,
        }
    }

    pub fn strip_components(mut self, n: u32) -> Self {
        self.strip_components = n;
        self
    }

    pub fn kernel_source(mut self) -> Self {
        self.kernel_source = true;
        self
    }
}

/// Result of an extraction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Completion marker was present; nothing was invoked.
    Skipped,
    /// Extracted via the named strategy.
    Extracted { strategy: String },
}

/// Completion marker recorded next to the target directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMarker {
    pub archive: String,
    pub strategy: String,
    pub timestamp: String,
}

/// Marker file path for a target directory: `<dest>.extracted.json`
/// sibling of the directory itself.
pub fn marker_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    dest.with_file_name(format!("{}.extracted.json", name))
}

/// Remove the completion marker (cleanup step, forced re-extraction).
pub fn forget_marker(dest: &Path) -> Result<()> {
    let marker = marker_path(dest);
    if marker.exists() {
        fs::remove_file(&marker)
            .with_context(|| format!("removing extraction marker '{}'", marker.display()))?;
    }
    Ok(())
}

/// Extract an archive through the environment's fallback chain.
///
/// Idempotent: a present completion marker short-circuits to success
/// without invoking any strategy.
pub fn extract(
    spec: &ExtractSpec,
    profile: &EnvironmentProfile,
    cache: Option<&CacheManager>,
) -> Result<ExtractOutcome> {
    let marker = marker_path(&spec.dest);
    if marker.exists() {
        println!(
            "  [SKIP] {} already extracted (marker present)",
            spec.archive.display()
        );
        return Ok(ExtractOutcome::Skipped);
    }

    if !spec.archive.exists() {
        bail!("archive not found: {}", spec.archive.display());
    }
    fs::create_dir_all(&spec.dest)
        .with_context(|| format!("creating extraction target '{}'", spec.dest.display()))?;

    let chain = resolve_chain(spec, profile, cache);
    debug_assert!(
        chain.iter().any(|s| !s.kind.needs_privilege()),
        "extraction chain must contain a strategy with no privilege prerequisites"
    );

    let target = spec.archive.display().to_string();
    let winner = try_strategies(&target, chain)?;

    if spec.kernel_source {
        let restored = restore_build_exec_bits(&spec.dest)?;
        println!("  Restored executable bits on {} build files", restored);
    }

    write_marker(spec, &winner)?;

    // Snapshot small trees for the cached-copy fallback of later runs.
    // The kernel tree is far too large to be worth archiving.
    if let Some(cache) = cache {
        if !spec.kernel_source {
            if let Err(e) = cache.store_extracted_tree(&archive_key(&spec.archive), &spec.dest) {
                eprintln!("  [WARN] could not snapshot extracted tree: {:#}", e);
            }
        }
    }

    Ok(ExtractOutcome::Extracted { strategy: winner })
}

fn write_marker(spec: &ExtractSpec, strategy: &str) -> Result<()> {
    let marker = ExtractionMarker {
        archive: archive_key(&spec.archive),
        strategy: strategy.to_string(),
        timestamp: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown-time".to_string()),
    };
    let path = marker_path(&spec.dest);
    let bytes = serde_json::to_vec_pretty(&marker)?;
    fs::write(&path, bytes)
        .with_context(|| format!("writing extraction marker '{}'", path.display()))?;
    Ok(())
}

fn archive_key(archive: &Path) -> String {
    archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string())
}

/// Build the ordered strategy chain for this request and environment.
fn resolve_chain(
    spec: &ExtractSpec,
    profile: &EnvironmentProfile,
    cache: Option<&CacheManager>,
) -> Vec<Strategy> {
    let mut chain = Vec::new();

    if spec.kernel_source {
        // Specialized tree handling regardless of environment.
        let s = spec.clone();
        chain.push(Strategy::new(
            StrategyKind::ContainerOptimized,
            Operation::Extract,
            "kernel-source extraction",
            move || run_tar(&s, None, true),
        ));
        if profile.has_sudo && !profile.is_root() {
            let s = spec.clone();
            chain.push(Strategy::new(
                StrategyKind::SudoElevated,
                Operation::Extract,
                "sudo kernel-source extraction",
                move || run_tar_sudo(&s, true),
            ));
        }
        return chain;
    }

    if profile.is_container() {
        if let Some(tool) = parallel_decompressor(&spec.archive) {
            let s = spec.clone();
            chain.push(Strategy::new(
                StrategyKind::ContainerOptimized,
                Operation::Extract,
                format!("parallel {} extraction", tool),
                move || run_tar(&s, Some(tool), false),
            ));
        }
        let s = spec.clone();
        chain.push(Strategy::new(
            StrategyKind::Direct,
            Operation::Extract,
            "sequential tar extraction",
            move || run_tar(&s, None, false),
        ));
        if let Some(cache) = cache {
            let cache = cache.clone();
            let key = archive_key(&spec.archive);
            let dest = spec.dest.clone();
            chain.push(Strategy::new(
                StrategyKind::Direct,
                Operation::Extract,
                "cached pre-extracted copy",
                move || {
                    if cache.restore_extracted_tree(&key, &dest)? {
                        Ok(())
                    } else {
                        bail!("no cached tree snapshot for '{}'", key)
                    }
                },
            ));
        }
        let s = spec.clone();
        chain.push(Strategy::new(
            StrategyKind::PlaceholderFallback,
            Operation::Extract,
            "compatible slow extraction",
            move || run_tar(&s, None, true),
        ));
        if profile.has_sudo && !profile.is_root() {
            let s = spec.clone();
            chain.push(Strategy::new(
                StrategyKind::SudoElevated,
                Operation::Extract,
                "sudo tar extraction",
                move || run_tar_sudo(&s, false),
            ));
        }
    } else {
        let s = spec.clone();
        chain.push(Strategy::new(
            StrategyKind::Direct,
            Operation::Extract,
            "direct tar extraction",
            move || run_tar(&s, None, false),
        ));
        if profile.has_sudo && !profile.is_root() {
            let s = spec.clone();
            chain.push(Strategy::new(
                StrategyKind::SudoElevated,
                Operation::Extract,
                "sudo tar extraction",
                move || run_tar_sudo(&s, false),
            ));
        }
    }

    chain
}

/// Pick a parallel decompressor matching the archive suffix, if installed.
fn parallel_decompressor(archive: &Path) -> Option<&'static str> {
    let name = archive.file_name()?.to_string_lossy().to_ascii_lowercase();
    let candidates: &[&str] = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        &["pigz"]
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        &["pixz"]
    } else if name.ends_with(".tar.zst") {
        &["pzstd"]
    } else if name.ends_with(".tar.bz2") {
        &["pbzip2"]
    } else {
        return None;
    };
    candidates.iter().copied().find(|t| command_exists(t))
}

fn tar_args(spec: &ExtractSpec, compat: bool) -> Vec<String> {
    let mut args = vec!["-xf".to_string(), spec.archive.display().to_string()];
    args.push("-C".to_string());
    args.push(spec.dest.display().to_string());
    if spec.strip_components > 0 {
        args.push(format!("--strip-components={}", spec.strip_components));
    }
    if compat || spec.kernel_source {
        // Skip ownership/permission normalization; compatible everywhere
        // and the only workable mode on container overlay filesystems.
        args.push("--no-same-owner".to_string());
        args.push("--no-same-permissions".to_string());
        args.push("--delay-directory-restore".to_string());
    }
    args
}

fn run_tar(spec: &ExtractSpec, decompressor: Option<&str>, compat: bool) -> Result<()> {
    let mut cmd = Cmd::new("tar");
    if let Some(tool) = decompressor {
        cmd = cmd.args(["-I", tool]);
    }
    cmd.args(tar_args(spec, compat))
        .error_msg(format!("tar failed extracting {}", spec.archive.display()))
        .run()?;
    Ok(())
}

fn run_tar_sudo(spec: &ExtractSpec, compat: bool) -> Result<()> {
    Cmd::new("sudo")
        .arg("tar")
        .args(tar_args(spec, compat))
        .error_msg(format!(
            "sudo tar failed extracting {}",
            spec.archive.display()
        ))
        .run()?;
    Ok(())
}

/// Restore the minimum executable bits a kernel build needs.
///
/// Only `Makefile` and `*.sh` under the build-tool directories are
/// touched; chowning or chmodding the full tree is prohibitively slow.
pub fn restore_build_exec_bits(tree: &Path) -> Result<usize> {
    const TOOL_DIRS: &[&str] = &["scripts", "tools"];

    let mut restored = 0usize;
    for sub in TOOL_DIRS {
        let dir = tree.join(sub);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name != "Makefile" && !name.ends_with(".sh") {
                continue;
            }
            let metadata = entry.metadata()?;
            let mut perms = metadata.permissions();
            let mode = perms.mode();
            if mode & 0o111 == 0 {
                perms.set_mode(mode | 0o755);
                fs::set_permissions(entry.path(), perms).with_context(|| {
                    format!("restoring exec bit on '{}'", entry.path().display())
                })?;
                restored += 1;
            }
        }
    }

    // The top-level Makefile drives everything.
    let makefile = tree.join("Makefile");
    if makefile.is_file() {
        let mut perms = fs::metadata(&makefile)?.permissions();
        let mode = perms.mode();
        if mode & 0o111 == 0 {
            perms.set_mode(mode | 0o755);
            fs::set_permissions(&makefile, perms)?;
            restored += 1;
        }
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Host;
    use std::fs::File;
    use tempfile::TempDir;

    fn bare_profile() -> EnvironmentProfile {
        EnvironmentProfile {
            host: Host::Bare,
            is_ci: false,
            has_sudo: false,
            uid: 1000,
            gid: 1000,
        }
    }

    fn container_profile() -> EnvironmentProfile {
        EnvironmentProfile {
            host: Host::Docker,
            is_ci: false,
            has_sudo: false,
            uid: 0,
            gid: 0,
        }
    }

    fn make_plain_tar(dir: &Path) -> PathBuf {
        let payload = dir.join("payload");
        fs::create_dir_all(&payload).unwrap();
        fs::write(payload.join("hello.txt"), b"hello").unwrap();

        let archive = dir.join("payload.tar");
        let file = File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all("payload", &payload).unwrap();
        builder.finish().unwrap();
        archive
    }

    #[test]
    fn marker_present_is_noop() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("rootfs");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("sentinel"), b"untouched").unwrap();
        fs::write(marker_path(&dest), b"{}").unwrap();

        // Archive path does not even exist; the marker short-circuits
        // before any strategy or filesystem check runs.
        let spec = ExtractSpec::new(tmp.path().join("missing.tar"), &dest);
        let outcome = extract(&spec, &bare_profile(), None).unwrap();
        assert_eq!(outcome, ExtractOutcome::Skipped);
        assert_eq!(fs::read(dest.join("sentinel")).unwrap(), b"untouched");
    }

    #[test]
    fn extraction_writes_marker() {
        let tmp = TempDir::new().unwrap();
        let archive = make_plain_tar(tmp.path());
        let dest = tmp.path().join("extracted");

        let spec = ExtractSpec::new(&archive, &dest);
        let outcome = extract(&spec, &bare_profile(), None).unwrap();
        assert!(matches!(outcome, ExtractOutcome::Extracted { .. }));
        assert!(dest.join("payload/hello.txt").exists());

        let marker: ExtractionMarker =
            serde_json::from_slice(&fs::read(marker_path(&dest)).unwrap()).unwrap();
        assert_eq!(marker.archive, "payload.tar");

        // Second run is a no-op.
        let outcome = extract(&spec, &bare_profile(), None).unwrap();
        assert_eq!(outcome, ExtractOutcome::Skipped);
    }

    #[test]
    fn strip_components_flattens_top_dir() {
        let tmp = TempDir::new().unwrap();
        let archive = make_plain_tar(tmp.path());
        let dest = tmp.path().join("flat");

        let spec = ExtractSpec::new(&archive, &dest).strip_components(1);
        extract(&spec, &bare_profile(), None).unwrap();
        assert!(dest.join("hello.txt").exists());
    }

    #[test]
    fn chain_order_for_container() {
        let tmp = TempDir::new().unwrap();
        let spec = ExtractSpec::new(tmp.path().join("a.tar.gz"), tmp.path().join("d"));
        let chain = resolve_chain(&spec, &container_profile(), None);
        // No sudo in the profile: chain must end with the
        // no-prerequisite compatible extractor.
        assert!(chain.len() >= 2);
        assert_eq!(
            chain.last().unwrap().kind,
            StrategyKind::PlaceholderFallback
        );
        assert!(chain.iter().any(|s| !s.kind.needs_privilege()));
    }

    #[test]
    fn kernel_chain_is_specialized() {
        let tmp = TempDir::new().unwrap();
        let spec =
            ExtractSpec::new(tmp.path().join("linux.tar.xz"), tmp.path().join("k")).kernel_source();
        let chain = resolve_chain(&spec, &container_profile(), None);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].kind, StrategyKind::ContainerOptimized);
    }

    #[test]
    fn exec_bits_restored_for_build_files() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path();
        fs::create_dir_all(tree.join("scripts")).unwrap();
        fs::write(tree.join("scripts/mkcompile.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(tree.join("scripts/README"), b"docs").unwrap();
        fs::write(tree.join("Makefile"), b"all:\n").unwrap();
        for f in ["scripts/mkcompile.sh", "scripts/README", "Makefile"] {
            let mut perms = fs::metadata(tree.join(f)).unwrap().permissions();
            perms.set_mode(0o644);
            fs::set_permissions(tree.join(f), perms).unwrap();
        }

        let restored = restore_build_exec_bits(tree).unwrap();
        assert_eq!(restored, 2);
        let mode = fs::metadata(tree.join("scripts/mkcompile.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
        // Non-build files untouched.
        let mode = fs::metadata(tree.join("scripts/README"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0);
    }

    #[test]
    fn fallback_success_records_marker_like_direct_success() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::open(&tmp.path().join("cache"), true).unwrap();

        // Seed a tree snapshot under the archive's key.
        let tree = tmp.path().join("seed");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("etc-release"), b"alpine").unwrap();
        cache.store_extracted_tree("broken.tar", &tree).unwrap();

        // The archive itself is garbage, so every tar strategy fails and
        // the chain falls through to the cached pre-extracted copy.
        let archive = tmp.path().join("broken.tar");
        fs::write(&archive, b"not a tar archive").unwrap();
        let dest = tmp.path().join("restored");

        let spec = ExtractSpec::new(&archive, &dest);
        let outcome = extract(&spec, &container_profile(), Some(&cache)).unwrap();
        assert_eq!(
            outcome,
            ExtractOutcome::Extracted {
                strategy: "cached pre-extracted copy".to_string()
            }
        );
        assert!(dest.join("etc-release").exists());

        let marker: ExtractionMarker =
            serde_json::from_slice(&fs::read(marker_path(&dest)).unwrap()).unwrap();
        assert_eq!(marker.archive, "broken.tar");

        // The marker makes the retry a no-op, exactly as after a direct
        // success.
        let outcome = extract(&spec, &container_profile(), Some(&cache)).unwrap();
        assert_eq!(outcome, ExtractOutcome::Skipped);
    }

    #[test]
    fn forget_marker_allows_reextraction() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("tree");
        fs::create_dir_all(&dest).unwrap();
        fs::write(marker_path(&dest), b"{}").unwrap();
        forget_marker(&dest).unwrap();
        assert!(!marker_path(&dest).exists());
    }
}
