//! Resource-aware execution planning.
//!
//! Kernel compilation is the memory hog of this pipeline: too many make
//! jobs on a small machine means OOM-killed compilers hours into a build.
//! The planner reads the host memory/CPU counters and derives a thread
//! count, a compiler-flag tier, and a swap decision before each expensive
//! step. The empirical rule is one compilation thread per 2 GB of
//! available memory.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::EnvironmentProfile;
use crate::process::Cmd;

/// kB of available memory per compilation thread (2 GB).
const KB_PER_THREAD: u64 = 2 * 1024 * 1024;
/// Below this (4 GB) the build uses minimal-size flags and may add swap.
const LOW_MEM_KB: u64 = 4 * 1024 * 1024;
/// Below this (8 GB) the build drops debug info.
const MID_MEM_KB: u64 = 8 * 1024 * 1024;
/// Size of the synthesized swap file, in MB.
pub const SWAP_SIZE_MB: u64 = 4096;

pub const SWAP_FILENAME: &str = ".rescue-swapfile";

/// Computed execution plan for one expensive step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    pub thread_count: usize,
    pub compiler_flags: String,
    pub use_swap: bool,
    pub swap_size_mb: u64,
}

impl ResourcePlan {
    pub fn jobs_arg(&self) -> String {
        format!("-j{}", self.thread_count)
    }
}

/// Compiler-flag tiers, degraded as memory shrinks.
fn flags_for_memory(avail_kb: u64) -> &'static str {
    if avail_kb < LOW_MEM_KB {
        // Minimal-size build, inlining disabled.
        "-Os -fno-inline -g0"
    } else if avail_kb < MID_MEM_KB {
        // Size-optimized, no debug info.
        "-Os -g0"
    } else {
        "-O2"
    }
}

/// Pure planning function; kept separate from the live counters so the
/// clamp and monotonicity properties are unit-testable.
pub fn plan_for(avail_kb: u64, core_count: usize, want_swap: bool) -> ResourcePlan {
    let cores = core_count.max(1);
    let by_memory = (avail_kb / KB_PER_THREAD) as usize;
    let thread_count = by_memory.clamp(1, cores);

    ResourcePlan {
        thread_count,
        compiler_flags: flags_for_memory(avail_kb).to_string(),
        use_swap: want_swap && avail_kb < LOW_MEM_KB,
        swap_size_mb: SWAP_SIZE_MB,
    }
}

/// Parse `MemAvailable` out of /proc/meminfo content, falling back to
/// 70% of `MemTotal` on kernels that do not report it.
pub fn parse_meminfo_available_kb(meminfo: &str) -> Option<u64> {
    if let Some(kb) = meminfo_field(meminfo, "MemAvailable:") {
        return Some(kb);
    }
    meminfo_field(meminfo, "MemTotal:").map(|total| total * 70 / 100)
}

fn meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Planner bound to a live host. Recomputed lazily whenever a step that
/// materially changes memory (swap creation/removal) completes.
#[derive(Debug, Clone)]
pub struct ResourcePlanner {
    profile: EnvironmentProfile,
    jobs_override: Option<usize>,
    want_swap: bool,
}

impl ResourcePlanner {
    pub fn new(profile: EnvironmentProfile, jobs_override: Option<usize>, want_swap: bool) -> Self {
        Self {
            profile,
            jobs_override,
            want_swap,
        }
    }

    /// Read the live counters and produce a plan.
    pub fn plan(&self) -> Result<ResourcePlan> {
        let avail_kb = self.available_memory_kb()?;
        let cores = core_count();
        let mut plan = plan_for(avail_kb, cores, self.want_swap);

        if let Some(jobs) = self.jobs_override {
            plan.thread_count = jobs.clamp(1, cores);
        }
        Ok(plan)
    }

    pub fn available_memory_kb(&self) -> Result<u64> {
        let meminfo =
            fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        parse_meminfo_available_kb(&meminfo)
            .context("could not find MemAvailable or MemTotal in /proc/meminfo")
    }

    /// Create the swap file if the plan calls for one and the environment
    /// permits it. Returns a guard whose teardown is guaranteed.
    ///
    /// Swap manipulation needs root; on an unprivileged host the request
    /// degrades to a warning rather than failing the step.
    pub fn ensure_swap(&self, plan: &ResourcePlan, workdir: &Path) -> Result<Option<SwapGuard>> {
        if !plan.use_swap {
            return Ok(None);
        }
        if !self.profile.can_elevate() {
            eprintln!("  [WARN] low memory but no root/sudo available; skipping swap file");
            return Ok(None);
        }

        let swap_path = workdir.join(SWAP_FILENAME);
        println!(
            "  Creating {} MB swap file at {}...",
            plan.swap_size_mb,
            swap_path.display()
        );

        let sudo = !self.profile.is_root();
        elevated(sudo, "fallocate")
            .args(["-l", &format!("{}M", plan.swap_size_mb)])
            .arg_path(&swap_path)
            .error_msg("fallocate failed while creating swap file")
            .run()?;
        elevated(sudo, "chmod")
            .arg("600")
            .arg_path(&swap_path)
            .error_msg("chmod on swap file failed")
            .run()?;
        elevated(sudo, "mkswap")
            .arg_path(&swap_path)
            .error_msg("mkswap failed")
            .run()?;
        elevated(sudo, "swapon")
            .arg_path(&swap_path)
            .error_msg("swapon failed (swap files may be unsupported on this filesystem)")
            .run()?;

        Ok(Some(SwapGuard {
            path: swap_path,
            sudo,
        }))
    }
}

fn core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn elevated(sudo: bool, program: &str) -> Cmd {
    if sudo {
        Cmd::new("sudo").arg(program)
    } else {
        Cmd::new(program)
    }
}

/// RAII guard for a synthesized swap file.
///
/// Dropping the guard (including on failure paths) swaps off and removes
/// the file; cleanup additionally sweeps any leftover from a crashed run.
#[derive(Debug)]
pub struct SwapGuard {
    path: PathBuf,
    sudo: bool,
}

impl SwapGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        release_swap_file(&self.path, self.sudo);
    }
}

/// Swap off and delete a swap file, best effort.
pub fn release_swap_file(path: &Path, sudo: bool) {
    if !path.exists() {
        return;
    }
    let _ = elevated(sudo, "swapoff").arg_path(path).run();
    if fs::remove_file(path).is_err() {
        let _ = elevated(sudo, "rm").arg("-f").arg_path(path).run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB_KB: u64 = 1024 * 1024;

    #[test]
    fn thread_count_within_bounds() {
        for avail_gb in 0..64 {
            let plan = plan_for(avail_gb * GB_KB, 8, false);
            assert!(plan.thread_count >= 1);
            assert!(plan.thread_count <= 8);
        }
    }

    #[test]
    fn thread_count_monotonic_in_memory() {
        let mut last = 0;
        for avail_gb in 0..64 {
            let plan = plan_for(avail_gb * GB_KB, 16, false);
            assert!(plan.thread_count >= last);
            last = plan.thread_count;
        }
        // Saturates at core count.
        assert_eq!(last, 16);
    }

    #[test]
    fn one_thread_per_two_gb() {
        assert_eq!(plan_for(8 * GB_KB, 32, false).thread_count, 4);
        assert_eq!(plan_for(2 * GB_KB, 32, false).thread_count, 1);
        // Below 2 GB still clamps to 1.
        assert_eq!(plan_for(512 * 1024, 32, false).thread_count, 1);
    }

    #[test]
    fn compiler_flags_degrade_by_tier() {
        assert_eq!(plan_for(2 * GB_KB, 4, false).compiler_flags, "-Os -fno-inline -g0");
        assert_eq!(plan_for(6 * GB_KB, 4, false).compiler_flags, "-Os -g0");
        assert_eq!(plan_for(16 * GB_KB, 4, false).compiler_flags, "-O2");
    }

    #[test]
    fn swap_only_when_requested_and_low() {
        assert!(plan_for(2 * GB_KB, 4, true).use_swap);
        assert!(!plan_for(2 * GB_KB, 4, false).use_swap);
        assert!(!plan_for(16 * GB_KB, 4, true).use_swap);
    }

    #[test]
    fn meminfo_prefers_mem_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    9000000 kB\n";
        assert_eq!(parse_meminfo_available_kb(meminfo), Some(9_000_000));
    }

    #[test]
    fn meminfo_falls_back_to_70_percent_of_total() {
        let meminfo = "MemTotal:       10000000 kB\nMemFree:         1000000 kB\n";
        assert_eq!(parse_meminfo_available_kb(meminfo), Some(7_000_000));
        assert_eq!(parse_meminfo_available_kb(""), None);
    }
}
