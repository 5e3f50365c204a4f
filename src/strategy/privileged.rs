//! Symlink and chroot operations with privilege fallbacks.
//!
//! Both operations may be denied on unprivileged hosts. The chain is:
//! direct attempt, sudo-elevated retry when sudo exists, and (only where
//! the caller marks the operation safe to skip) a warned placeholder
//! no-op. An unsafe operation with no working strategy is fatal.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::EnvironmentProfile;
use crate::process::Cmd;
use crate::strategy::{try_strategies, Operation, Strategy, StrategyKind};

const PLACEHOLDER_NAME: &str = "placeholder no-op";

/// How a privileged operation concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedOutcome {
    Done { strategy: String },
    /// The placeholder fallback fired: nothing was done, a warning was
    /// printed, and the pipeline continues.
    Skipped,
}

fn placeholder(operation: Operation, description: String) -> Strategy {
    Strategy::new(
        StrategyKind::PlaceholderFallback,
        operation,
        PLACEHOLDER_NAME,
        move || {
            eprintln!(
                "  [WARN] {} could not be performed with available privileges; continuing without it",
                description
            );
            Ok(())
        },
    )
}

fn outcome_for(winner: String) -> PrivilegedOutcome {
    if winner == PLACEHOLDER_NAME {
        PrivilegedOutcome::Skipped
    } else {
        PrivilegedOutcome::Done { strategy: winner }
    }
}

/// Create (or replace) a symlink through the fallback chain.
pub fn create_symlink(
    target: &Path,
    link: &Path,
    profile: &EnvironmentProfile,
    safe_skip: bool,
) -> Result<PrivilegedOutcome> {
    let mut chain = Vec::new();

    let t = target.to_path_buf();
    let l = link.to_path_buf();
    chain.push(Strategy::new(
        StrategyKind::Direct,
        Operation::Symlink,
        "direct symlink",
        move || symlink_replacing(&t, &l),
    ));

    if profile.has_sudo && !profile.is_root() {
        let t = target.to_path_buf();
        let l = link.to_path_buf();
        chain.push(Strategy::new(
            StrategyKind::SudoElevated,
            Operation::Symlink,
            "sudo ln -sfn",
            move || {
                Cmd::new("sudo")
                    .args(["ln", "-sfn"])
                    .arg_path(&t)
                    .arg_path(&l)
                    .error_msg("sudo ln failed")
                    .run()?;
                Ok(())
            },
        ));
    }

    if safe_skip {
        chain.push(placeholder(
            Operation::Symlink,
            format!("symlink {} -> {}", link.display(), target.display()),
        ));
    }

    let label = format!("{} -> {}", link.display(), target.display());
    let winner = try_strategies(&label, chain)?;
    Ok(outcome_for(winner))
}

fn symlink_replacing(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent of '{}'", link.display()))?;
    }
    match fs::symlink_metadata(link) {
        Ok(md) if md.file_type().is_dir() && !md.file_type().is_symlink() => {
            fs::remove_dir_all(link)
                .with_context(|| format!("removing directory at '{}'", link.display()))?;
        }
        Ok(_) => {
            fs::remove_file(link)
                .with_context(|| format!("removing existing '{}'", link.display()))?;
        }
        Err(_) => {}
    }
    std::os::unix::fs::symlink(target, link).with_context(|| {
        format!(
            "creating symlink '{}' -> '{}'",
            link.display(),
            target.display()
        )
    })
}

/// Run a command inside a chroot through the fallback chain.
///
/// The command is given as program + args relative to the rootfs.
pub fn run_in_chroot(
    rootfs: &Path,
    command: &[&str],
    profile: &EnvironmentProfile,
    safe_skip: bool,
) -> Result<PrivilegedOutcome> {
    run_in_chroot_inner(rootfs, command, None, profile, safe_skip)
}

/// Like `run_in_chroot`, but feeds `input` to the command's stdin.
///
/// Credentials go through here: stdin never appears in argv and never
/// passes through a shell.
pub fn run_in_chroot_with_input(
    rootfs: &Path,
    command: &[&str],
    input: &[u8],
    profile: &EnvironmentProfile,
    safe_skip: bool,
) -> Result<PrivilegedOutcome> {
    run_in_chroot_inner(rootfs, command, Some(input.to_vec()), profile, safe_skip)
}

fn run_in_chroot_inner(
    rootfs: &Path,
    command: &[&str],
    input: Option<Vec<u8>>,
    profile: &EnvironmentProfile,
    safe_skip: bool,
) -> Result<PrivilegedOutcome> {
    let rootfs = rootfs.to_path_buf();
    let args: Vec<String> = command.iter().map(|s| s.to_string()).collect();
    let mut chain = Vec::new();

    // Root (common in containers) can chroot directly; the attempt also
    // doubles as the cheap first try elsewhere.
    {
        let rootfs = rootfs.clone();
        let args = args.clone();
        let input = input.clone();
        let kind = if profile.is_container() {
            StrategyKind::ContainerOptimized
        } else {
            StrategyKind::Direct
        };
        chain.push(Strategy::new(
            kind,
            Operation::ChrootOp,
            "direct chroot",
            move || run_chroot_cmd(&rootfs, &args, input.as_deref(), false),
        ));
    }

    if profile.has_sudo && !profile.is_root() {
        let rootfs = rootfs.clone();
        let args = args.clone();
        let input = input.clone();
        chain.push(Strategy::new(
            StrategyKind::SudoElevated,
            Operation::ChrootOp,
            "sudo chroot",
            move || run_chroot_cmd(&rootfs, &args, input.as_deref(), true),
        ));
    }

    if safe_skip {
        chain.push(placeholder(
            Operation::ChrootOp,
            format!("chroot command '{}'", command.join(" ")),
        ));
    }

    let label = format!("chroot {}: {}", rootfs.display(), command.join(" "));
    let winner = try_strategies(&label, chain)?;
    Ok(outcome_for(winner))
}

fn run_chroot_cmd(rootfs: &PathBuf, args: &[String], input: Option<&[u8]>, sudo: bool) -> Result<()> {
    let mut cmd = if sudo {
        Cmd::new("sudo").arg("chroot")
    } else {
        Cmd::new("chroot")
    };
    cmd = cmd.arg_path(rootfs);
    cmd = cmd
        .args(args.iter().cloned())
        .error_msg(format!("chroot command failed: {}", args.join(" ")));
    if let Some(data) = input {
        cmd = cmd.stdin_bytes(data.to_vec());
    }
    cmd.run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Host;
    use tempfile::TempDir;

    fn unprivileged() -> EnvironmentProfile {
        EnvironmentProfile {
            host: Host::Bare,
            is_ci: false,
            has_sudo: false,
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn direct_symlink_created_and_replaced() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("bin");

        let outcome =
            create_symlink(Path::new("usr/bin"), &link, &unprivileged(), false).unwrap();
        assert!(matches!(outcome, PrivilegedOutcome::Done { .. }));
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("usr/bin"));

        // Replacing an existing directory.
        fs::remove_file(&link).unwrap();
        fs::create_dir_all(link.join("sub")).unwrap();
        create_symlink(Path::new("usr/sbin"), &link, &unprivileged(), false).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("usr/sbin"));
    }

    #[test]
    fn safe_chroot_op_degrades_to_placeholder() {
        let tmp = TempDir::new().unwrap();
        // Empty rootfs: chroot either fails for lack of privileges or for
        // lack of the target binary; the placeholder then fires.
        let outcome = run_in_chroot(
            tmp.path(),
            &["/bin/definitely-missing"],
            &unprivileged(),
            true,
        )
        .unwrap();
        assert_eq!(outcome, PrivilegedOutcome::Skipped);
    }

    #[test]
    fn unsafe_chroot_op_is_fatal_when_exhausted() {
        let tmp = TempDir::new().unwrap();
        let err = run_in_chroot(
            tmp.path(),
            &["/bin/definitely-missing"],
            &unprivileged(),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("all strategies exhausted"));
    }
}
