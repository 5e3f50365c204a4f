//! Source and compiler caches.
//!
//! The cache directory is partitioned into:
//! - `sources/`  - downloaded archives, keyed by the final path component
//!   of the download URL, plus tar.zst snapshots of extracted trees
//! - `ccache/`   - compiler cache, delegated to the external ccache tool
//! - `packages/` - apk packages fetched into the rootfs
//!
//! Tree snapshots use a deterministic tar.zst codec with a sha256
//! sidecar so corruption is detected on restore.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::preflight::command_exists;
use crate::process::Cmd;

/// ccache size ceiling.
const CCACHE_MAX_SIZE: &str = "5G";

/// Sidecar metadata for a cached tree snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    sha256: String,
    created_at: String,
}

/// Cache manager rooted at the configured cache directory.
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
    enabled: bool,
}

impl CacheManager {
    /// Open (and create if needed) the cache layout.
    pub fn open(root: &Path, enabled: bool) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
            enabled,
        };
        if enabled {
            for sub in ["sources", "ccache", "packages"] {
                fs::create_dir_all(root.join(sub))
                    .with_context(|| format!("creating cache directory '{}'", root.display()))?;
            }
        }
        Ok(cache)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn ccache_dir(&self) -> PathBuf {
        self.root.join("ccache")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Source cache key: final path component of the download URL.
    pub fn source_key(url: &str) -> Result<String> {
        let key = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        if key.is_empty() || key.contains("..") {
            bail!("cannot derive cache key from URL '{}'", url);
        }
        Ok(key.to_string())
    }

    /// Fetch a source archive into `dest_dir`, consulting the cache.
    ///
    /// Hit: copy the cached file into place. Miss: download, then store a
    /// copy before returning. Downloads are never retried automatically;
    /// the error carries the remediation.
    pub fn get_or_fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let key = Self::source_key(url)?;
        let dest = dest_dir.join(&key);
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating download dir '{}'", dest_dir.display()))?;

        if dest.exists() {
            println!("  [SKIP] {} already downloaded", key);
            return Ok(dest);
        }

        if self.enabled {
            let cached = self.sources_dir().join(&key);
            if cached.exists() {
                println!("  Cache hit: {}", key);
                fs::copy(&cached, &dest).with_context(|| {
                    format!("copying cached source '{}' into place", cached.display())
                })?;
                return Ok(dest);
            }
        }

        println!("  Downloading {}...", url);
        download(url, &dest)?;

        if self.enabled {
            let cached = self.sources_dir().join(&key);
            let _lock = self.lock(&key)?;
            if !cached.exists() {
                let tmp = cached.with_extension("part");
                fs::copy(&dest, &tmp)
                    .with_context(|| format!("staging source into cache '{}'", tmp.display()))?;
                fs::rename(&tmp, &cached)
                    .with_context(|| format!("committing cached source '{}'", cached.display()))?;
            }
        }

        Ok(dest)
    }

    /// Configure the external compiler cache and return its directory.
    ///
    /// Returns `None` when ccache is not installed or caching is off;
    /// build steps then compile without it.
    pub fn setup_ccache(&self) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        if !command_exists("ccache") {
            eprintln!("  [WARN] ccache not installed; compiler cache disabled");
            return Ok(None);
        }

        let dir = self.ccache_dir();
        let dir_str = dir.display().to_string();
        Cmd::new("ccache")
            .env("CCACHE_DIR", &dir_str)
            .args(["--max-size", CCACHE_MAX_SIZE])
            .error_msg("ccache --max-size failed")
            .run()?;
        Cmd::new("ccache")
            .env("CCACHE_DIR", &dir_str)
            .args(["--set-config", "compression=true"])
            .error_msg("ccache --set-config failed")
            .run()?;
        println!(
            "  Compiler cache at {} ({} ceiling, compressed)",
            dir.display(),
            CCACHE_MAX_SIZE
        );
        Ok(Some(dir))
    }

    fn tree_blob_path(&self, key: &str) -> PathBuf {
        self.sources_dir().join(format!("{}.tree.tar.zst", key))
    }

    fn tree_meta_path(&self, key: &str) -> PathBuf {
        self.sources_dir().join(format!("{}.tree.json", key))
    }

    /// Snapshot an extracted tree for the cached-copy extraction fallback.
    pub fn store_extracted_tree(&self, key: &str, tree: &Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !tree.is_dir() {
            bail!("tree snapshot source is not a directory: {}", tree.display());
        }

        let _lock = self.lock(key)?;
        let blob = self.tree_blob_path(key);
        let tmp = blob.with_extension("part");
        create_tar_zst(tree, &tmp)?;
        let (sha256, _size) = sha256_file(&tmp)?;
        fs::rename(&tmp, &blob)
            .with_context(|| format!("committing tree snapshot '{}'", blob.display()))?;

        let meta = SnapshotMeta {
            sha256,
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "unknown-time".to_string()),
        };
        fs::write(self.tree_meta_path(key), serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("writing snapshot metadata for '{}'", key))?;
        Ok(())
    }

    /// Restore a snapshot into `dest`. Returns false when no snapshot
    /// exists; fails on hash mismatch (corrupt blob).
    pub fn restore_extracted_tree(&self, key: &str, dest: &Path) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let blob = self.tree_blob_path(key);
        let meta_path = self.tree_meta_path(key);
        if !blob.exists() || !meta_path.exists() {
            return Ok(false);
        }

        let meta: SnapshotMeta = serde_json::from_slice(
            &fs::read(&meta_path)
                .with_context(|| format!("reading snapshot metadata '{}'", meta_path.display()))?,
        )
        .with_context(|| format!("parsing snapshot metadata '{}'", meta_path.display()))?;

        let (actual, _size) = sha256_file(&blob)?;
        if actual != meta.sha256 {
            bail!(
                "cached tree snapshot for '{}' is corrupt\n  expected: {}\n  actual:   {}",
                key,
                meta.sha256,
                actual
            );
        }

        fs::create_dir_all(dest)?;
        let file = File::open(&blob)?;
        let decoder = zstd::stream::Decoder::new(file)?;
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(dest)
            .with_context(|| format!("unpacking tree snapshot '{}'", blob.display()))?;
        Ok(true)
    }

    fn lock(&self, key: &str) -> Result<CacheLock> {
        let path = self.sources_dir().join(format!("{}.lock", key));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating cache lock '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!("cache key '{}' is locked by another process", key);
        }
        Ok(CacheLock { _file: file, path })
    }
}

/// Download a URL to a file with curl, falling back to wget.
///
/// Network failures are surfaced once with a remediation hint; the
/// pipeline never retries downloads automatically.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    let tmp = dest.with_extension("part");
    let result = if command_exists("curl") {
        Cmd::new("curl")
            .args(["-fL", "-o"])
            .arg_path(&tmp)
            .arg(url)
            .error_msg(format!(
                "download failed: {}\n  Check network connectivity, then re-run with --resume",
                url
            ))
            .run()
            .map(|_| ())
    } else if command_exists("wget") {
        Cmd::new("wget")
            .args(["-q", "-O"])
            .arg_path(&tmp)
            .arg(url)
            .error_msg(format!(
                "download failed: {}\n  Check network connectivity, then re-run with --resume",
                url
            ))
            .run()
            .map(|_| ())
    } else {
        bail!("neither curl nor wget is installed")
    };

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, dest)
        .with_context(|| format!("committing download '{}'", dest.display()))?;
    Ok(())
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Create a deterministic tar.zst of a directory (sorted entries, zeroed
/// timestamps and ownership) so identical trees produce identical blobs.
fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<PathBuf> = WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| e.path().to_path_buf())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy().into_owned();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy().into_owned();
        ra.cmp(&rb)
    });

    for path in entries {
        let rel = path
            .strip_prefix(src_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let md = fs::symlink_metadata(&path)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode());
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(target.to_string_lossy().as_ref())?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut file = File::open(&path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut file)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing tree snapshot tar")?;
    encoder.finish()?;
    Ok(())
}
