//! Host environment classification.
//!
//! Privileged operations (extraction, symlinking, chroot) need different
//! strategies depending on where the pipeline runs: a bare metal host, a
//! Docker container, or a CI runner. The classifier inspects the host once
//! at startup and produces an immutable profile consumed by every
//! downstream strategy decision.
//!
//! This is the only module that reads the ambient process environment;
//! everything else receives an explicit `Config` or `EnvironmentProfile`.

use std::fs;
use std::path::Path;

/// Explicit override: set to "1"/"true" to force container classification.
pub const CONTAINER_OVERRIDE_VAR: &str = "RESCUE_IN_CONTAINER";

/// Kind of host the pipeline is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    /// Bare metal or a plain VM.
    Bare,
    /// Inside a Docker/Podman container.
    Docker,
    /// A CI runner (may itself be containerized; CI wins for policy).
    Ci,
}

impl Host {
    pub fn name(&self) -> &'static str {
        match self {
            Host::Bare => "bare",
            Host::Docker => "docker",
            Host::Ci => "ci",
        }
    }
}

/// Immutable snapshot of the execution environment.
///
/// Computed once per run; consumed by the resource planner and every
/// strategy table.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentProfile {
    pub host: Host,
    pub is_ci: bool,
    pub has_sudo: bool,
    pub uid: u32,
    pub gid: u32,
}

impl EnvironmentProfile {
    pub fn is_container(&self) -> bool {
        matches!(self.host, Host::Docker)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Whether privileged operations can be attempted at all, either
    /// directly (root) or through sudo.
    pub fn can_elevate(&self) -> bool {
        self.is_root() || self.has_sudo
    }
}

/// Classify the current host.
///
/// Pure function of host state with no failure mode: unknown states
/// default to a bare host with no elevated access assumed.
pub fn classify() -> EnvironmentProfile {
    let is_ci = env_truthy("CI");
    let in_container = env_truthy(CONTAINER_OVERRIDE_VAR) || container_markers_present();

    let host = if is_ci {
        Host::Ci
    } else if in_container {
        Host::Docker
    } else {
        Host::Bare
    };

    let (uid, gid) = current_ids();

    EnvironmentProfile {
        host,
        is_ci,
        has_sudo: which::which("sudo").is_ok(),
        uid,
        gid,
    }
}

fn env_truthy(var: &str) -> bool {
    match std::env::var(var) {
        Ok(value) => {
            let v = value.trim().to_ascii_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "no"
        }
        Err(_) => false,
    }
}

/// Filesystem markers left by container runtimes.
fn container_markers_present() -> bool {
    if Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() {
        return true;
    }
    cgroup_indicates_container(
        &fs::read_to_string("/proc/1/cgroup").unwrap_or_default(),
    )
}

fn cgroup_indicates_container(cgroup: &str) -> bool {
    cgroup.lines().any(|line| {
        line.contains("/docker/")
            || line.contains("/docker-")
            || line.contains("/lxc/")
            || line.contains("containerd")
            || line.contains("/kubepods")
    })
}

fn current_ids() -> (u32, u32) {
    // Safe: getuid/getgid cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_always_returns_profile() {
        let profile = classify();
        assert!(matches!(profile.host, Host::Bare | Host::Docker | Host::Ci));
        // uid/gid come straight from the kernel; just check consistency.
        assert_eq!(profile.is_root(), profile.uid == 0);
    }

    #[test]
    fn cgroup_docker_marker_detected() {
        let cgroup = "12:pids:/docker/0123456789abcdef\n1:name=systemd:/docker/0123456789abcdef\n";
        assert!(cgroup_indicates_container(cgroup));
    }

    #[test]
    fn cgroup_bare_host_not_detected() {
        let cgroup = "12:pids:/init.scope\n1:name=systemd:/init.scope\n";
        assert!(!cgroup_indicates_container(cgroup));
        assert!(!cgroup_indicates_container(""));
    }

    #[test]
    fn host_names_are_stable() {
        assert_eq!(Host::Bare.name(), "bare");
        assert_eq!(Host::Docker.name(), "docker");
        assert_eq!(Host::Ci.name(), "ci");
    }

    #[test]
    fn can_elevate_for_root() {
        let profile = EnvironmentProfile {
            host: Host::Docker,
            is_ci: false,
            has_sudo: false,
            uid: 0,
            gid: 0,
        };
        assert!(profile.can_elevate());
    }
}
