//! Install step: populate the rootfs.
//!
//! The extracted minirootfs is turned into a usable recovery userland:
//! DNS so apk can resolve mirrors, the package repositories for the
//! pinned Alpine release, the base and feature package sets installed via
//! chroot, the merged-/usr layout, and finally the root password policy.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::config::{Config, PasswordPolicy};
use crate::environment::EnvironmentProfile;
use crate::pipeline::fetch::ALPINE_VERSION;
use crate::process::ensure_exists;
use crate::strategy::privileged::{create_symlink, run_in_chroot, run_in_chroot_with_input};

/// Packages every image gets regardless of feature selection.
const BASE_PACKAGES: &[&str] = &["alpine-base", "busybox", "e2fsprogs", "util-linux", "parted"];

const GENERATED_PASSWORD_LEN: usize = 20;
const PASSWORD_FILENAME: &str = "root-password.txt";

pub fn run(config: &Config, profile: &EnvironmentProfile) -> Result<()> {
    let rootfs = config.rootfs_dir();
    ensure_exists(&rootfs, "rootfs (run the fetch step first)")?;

    seed_resolv_conf(&rootfs)?;
    write_repositories(&rootfs)?;
    merge_usr(&rootfs, profile)?;
    install_packages(config, &rootfs, profile)?;
    apply_password_policy(config, &rootfs, profile)?;

    Ok(())
}

/// Copy the host's resolver config so apk can reach mirrors from inside
/// the chroot. Hosts without one get a public resolver.
fn seed_resolv_conf(rootfs: &Path) -> Result<()> {
    let dest = rootfs.join("etc/resolv.conf");
    fs::create_dir_all(rootfs.join("etc"))?;
    match fs::copy("/etc/resolv.conf", &dest) {
        Ok(_) => {}
        Err(_) => {
            fs::write(&dest, "nameserver 1.1.1.1\n")
                .with_context(|| format!("writing '{}'", dest.display()))?;
        }
    }
    Ok(())
}

fn write_repositories(rootfs: &Path) -> Result<()> {
    let dir = rootfs.join("etc/apk");
    fs::create_dir_all(&dir)?;
    let content = format!(
        "https://dl-cdn.alpinelinux.org/alpine/v{v}/main\n\
         https://dl-cdn.alpinelinux.org/alpine/v{v}/community\n",
        v = ALPINE_VERSION
    );
    fs::write(dir.join("repositories"), content).context("writing apk repositories")
}

/// Migrate /bin, /sbin and /lib into their /usr counterparts and replace
/// them with symlinks, so the image ships the merged-/usr layout modern
/// init tooling expects. Runs before package installation so apk writes
/// into the merged tree. Skippable: an unmerged image still boots.
fn merge_usr(rootfs: &Path, profile: &EnvironmentProfile) -> Result<()> {
    const MERGED: &[(&str, &str)] = &[("usr/bin", "bin"), ("usr/sbin", "sbin"), ("usr/lib", "lib")];

    for (target, link) in MERGED {
        let link_path = rootfs.join(link);
        let md = match fs::symlink_metadata(&link_path) {
            Ok(md) => md,
            Err(_) => continue,
        };
        if md.file_type().is_symlink() {
            continue; // already merged
        }

        let target_path = rootfs.join(target);
        fs::create_dir_all(&target_path)?;
        for entry in fs::read_dir(&link_path)
            .with_context(|| format!("reading '{}'", link_path.display()))?
        {
            let entry = entry?;
            let to = target_path.join(entry.file_name());
            if to.exists() {
                // The /usr copy wins; drop the duplicate explicitly so
                // the symlink replacement below cannot silently discard
                // anything.
                eprintln!(
                    "  [WARN] '{}' already exists in merged /usr; keeping it and dropping '{}'",
                    to.display(),
                    entry.path().display()
                );
                remove_dir_entry(&entry.path())?;
            } else {
                fs::rename(entry.path(), &to).with_context(|| {
                    format!("moving '{}' into merged /usr", entry.path().display())
                })?;
            }
        }

        create_symlink(Path::new(target), &link_path, profile, true)?;
    }
    Ok(())
}

fn remove_dir_entry(path: &Path) -> Result<()> {
    let md = fs::symlink_metadata(path)
        .with_context(|| format!("inspecting '{}'", path.display()))?;
    if md.file_type().is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("removing '{}'", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))
    }
}

fn install_packages(config: &Config, rootfs: &Path, profile: &EnvironmentProfile) -> Result<()> {
    let mut packages: Vec<&str> = BASE_PACKAGES.to_vec();
    for feature in config.features.enabled() {
        packages.extend_from_slice(feature.rootfs_packages());
    }

    println!("  Installing {} packages into rootfs", packages.len());
    let mut command = vec!["/sbin/apk", "add", "--no-cache"];
    command.extend_from_slice(&packages);
    run_in_chroot(rootfs, &command, profile, false)?;
    Ok(())
}

fn apply_password_policy(
    config: &Config,
    rootfs: &Path,
    profile: &EnvironmentProfile,
) -> Result<()> {
    match &config.password {
        PasswordPolicy::Explicit(password) => {
            set_root_password(rootfs, password, profile)?;
            println!("  Root password set");
        }
        PasswordPolicy::Generate => {
            let password = generate_password(GENERATED_PASSWORD_LEN)?;
            set_root_password(rootfs, &password, profile)?;

            let out = config.out_dir();
            fs::create_dir_all(&out)?;
            let path = out.join(PASSWORD_FILENAME);
            fs::write(&path, format!("{}\n", password))
                .with_context(|| format!("writing '{}'", path.display()))?;
            println!("  Generated root password written to {}", path.display());
        }
        PasswordPolicy::LockRoot => {
            // Console-only image; a locked account is still reachable via
            // the kernel console.
            run_in_chroot(rootfs, &["/usr/bin/passwd", "-l", "root"], profile, true)?;
            println!("  Root account locked");
        }
    }
    Ok(())
}

/// Set the root password via chpasswd's stdin. The password never enters
/// an argv (visible in `ps`) and never passes through a shell, so quotes
/// and metacharacters in it are harmless.
fn set_root_password(rootfs: &Path, password: &str, profile: &EnvironmentProfile) -> Result<()> {
    run_in_chroot_with_input(
        rootfs,
        &["/usr/sbin/chpasswd"],
        credential_line(password).as_bytes(),
        profile,
        false,
    )?;
    Ok(())
}

/// The `user:password` line chpasswd reads from stdin, verbatim.
fn credential_line(password: &str) -> String {
    format!("root:{}\n", password)
}

/// Random alphanumeric password from the kernel entropy pool.
fn generate_password(len: usize) -> Result<String> {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut file = fs::File::open("/dev/urandom").context("opening /dev/urandom")?;
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes).context("reading /dev/urandom")?;

    Ok(bytes
        .iter()
        .map(|b| CHARSET[*b as usize % CHARSET.len()] as char)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_password_is_alphanumeric() {
        let password = generate_password(20).unwrap();
        assert_eq!(password.len(), 20);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        // Vanishingly unlikely to collide.
        assert_ne!(password, generate_password(20).unwrap());
    }

    #[test]
    fn repositories_pin_the_release() {
        let tmp = TempDir::new().unwrap();
        write_repositories(tmp.path()).unwrap();
        let content = fs::read_to_string(tmp.path().join("etc/apk/repositories")).unwrap();
        assert!(content.contains(ALPINE_VERSION));
        assert!(content.contains("/main"));
        assert!(content.contains("/community"));
    }

    #[test]
    fn resolv_conf_is_seeded() {
        let tmp = TempDir::new().unwrap();
        seed_resolv_conf(tmp.path()).unwrap();
        let content = fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap();
        assert!(content.contains("nameserver"));
    }

    #[test]
    fn credential_line_keeps_metacharacters_verbatim() {
        // Quotes and shell syntax in a password must survive untouched;
        // the line goes straight to chpasswd's stdin.
        assert_eq!(credential_line("it's"), "root:it's\n");
        assert_eq!(
            credential_line("a;$(reboot)|'\"&"),
            "root:a;$(reboot)|'\"&\n"
        );
    }

    #[test]
    fn merge_usr_moves_content_and_links() {
        use crate::environment::Host;
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("bin")).unwrap();
        fs::write(rootfs.join("bin/busybox"), b"elf").unwrap();
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();

        let profile = EnvironmentProfile {
            host: Host::Bare,
            is_ci: false,
            has_sudo: false,
            uid: 1000,
            gid: 1000,
        };
        merge_usr(rootfs, &profile).unwrap();

        assert!(rootfs.join("usr/bin/busybox").exists());
        let md = fs::symlink_metadata(rootfs.join("bin")).unwrap();
        assert!(md.file_type().is_symlink());
        // Idempotent.
        merge_usr(rootfs, &profile).unwrap();
    }

    #[test]
    fn merge_usr_keeps_usr_copy_on_collision() {
        use crate::environment::Host;
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("bin")).unwrap();
        fs::write(rootfs.join("bin/sh"), b"old").unwrap();
        fs::write(rootfs.join("bin/only-here"), b"keep").unwrap();
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::write(rootfs.join("usr/bin/sh"), b"merged").unwrap();

        let profile = EnvironmentProfile {
            host: Host::Bare,
            is_ci: false,
            has_sudo: false,
            uid: 1000,
            gid: 1000,
        };
        merge_usr(rootfs, &profile).unwrap();

        // The /usr copy wins; non-colliding entries still move.
        assert_eq!(fs::read(rootfs.join("usr/bin/sh")).unwrap(), b"merged");
        assert_eq!(fs::read(rootfs.join("usr/bin/only-here")).unwrap(), b"keep");
        let md = fs::symlink_metadata(rootfs.join("bin")).unwrap();
        assert!(md.file_type().is_symlink());
    }
}
