//! CLI entry point.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use rescue_builder::checkpoint::Step;
use rescue_builder::config::{Config, FeatureSet, PasswordPolicy};
use rescue_builder::environment;
use rescue_builder::pipeline::{Pipeline, StepRequest};

/// rescue-builder - build a bootable Alpine/ZFS recovery image
///
/// Runs a fixed, checkpointed pipeline (prepare, fetch, install,
/// configure, build, cleanup) that downloads an Alpine rootfs and a
/// kernel, compiles both to the host's resources, and emits a bootable
/// ISO with a SHA512 checksum.
#[derive(Parser, Debug)]
#[command(name = "rescue-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pipeline step to run, or `all` for the full pipeline
    #[arg(value_enum)]
    step: StepArg,

    /// Resume after the last completed step instead of restarting
    #[arg(long)]
    resume: bool,

    /// Remove all previous intermediates before starting
    #[arg(long, conflicts_with = "resume")]
    clean_start: bool,

    /// Remove intermediates after a successful run (keeps out/)
    #[arg(long)]
    clean_end: bool,

    /// Skip host validation (start a full run at fetch)
    #[arg(long)]
    skip_prepare: bool,

    /// Stream build tool output instead of capturing it
    #[arg(short, long)]
    verbose: bool,

    /// Working directory for all intermediates and outputs
    #[arg(long, env = "RESCUE_WORKDIR", default_value = "rescue-build")]
    workdir: PathBuf,

    /// Cache directory (defaults to ~/.cache/rescue-builder)
    #[arg(long, env = "RESCUE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Reuse downloads, extracted trees and compiler output across runs
    #[arg(long, env = "RESCUE_USE_CACHE")]
    use_cache: bool,

    /// Directory of kernel config overlays (base.conf + per-feature patches)
    #[arg(long, env = "RESCUE_KCONFIG_DIR", default_value = "config/kconfig")]
    kconfig_dir: PathBuf,

    /// Parallel build jobs (default: derived from available memory)
    #[arg(short, long, env = "RESCUE_JOBS")]
    jobs: Option<usize>,

    /// Create a temporary swap file when memory is low
    #[arg(long, env = "RESCUE_USE_SWAP")]
    use_swap: bool,

    /// Disable every optional feature
    #[arg(long)]
    minimal: bool,

    /// Include OpenZFS (kernel options + userland built from source)
    #[arg(long, env = "RESCUE_WITH_ZFS", overrides_with = "without_zfs")]
    with_zfs: bool,
    /// Exclude OpenZFS
    #[arg(long, overrides_with = "with_zfs")]
    without_zfs: bool,

    /// Include Btrfs support
    #[arg(long, env = "RESCUE_WITH_BTRFS", overrides_with = "without_btrfs")]
    with_btrfs: bool,
    /// Exclude Btrfs support
    #[arg(long, overrides_with = "with_btrfs")]
    without_btrfs: bool,

    /// Include data-recovery tools (testdisk, ddrescue, smartmontools)
    #[arg(long, env = "RESCUE_WITH_RECOVERY_TOOLS", overrides_with = "without_recovery_tools")]
    with_recovery_tools: bool,
    /// Exclude data-recovery tools
    #[arg(long, overrides_with = "with_recovery_tools")]
    without_recovery_tools: bool,

    /// Include network tools (openssh, rsync, tcpdump)
    #[arg(long, env = "RESCUE_WITH_NETWORK_TOOLS", overrides_with = "without_network_tools")]
    with_network_tools: bool,
    /// Exclude network tools
    #[arg(long, overrides_with = "with_network_tools")]
    without_network_tools: bool,

    /// Include crypto/LVM/RAID support (cryptsetup, lvm2, mdadm)
    #[arg(long, env = "RESCUE_WITH_CRYPTO", overrides_with = "without_crypto")]
    with_crypto: bool,
    /// Exclude crypto/LVM/RAID support
    #[arg(long, overrides_with = "with_crypto")]
    without_crypto: bool,

    /// Include console UI tooling (ncurses, dialog)
    #[arg(long, env = "RESCUE_WITH_TUI", overrides_with = "without_tui")]
    with_tui: bool,
    /// Exclude console UI tooling
    #[arg(long, overrides_with = "with_tui")]
    without_tui: bool,

    /// Compress image binaries with upx and prefer a smaller kernel
    #[arg(long, env = "RESCUE_WITH_COMPRESSION", overrides_with = "without_compression")]
    with_compression: bool,
    /// Disable binary compression
    #[arg(long, overrides_with = "with_compression")]
    without_compression: bool,

    /// Set the image's root password
    #[arg(
        long,
        env = "RESCUE_ROOT_PASSWORD",
        conflicts_with_all = ["generate_password", "lock_root"]
    )]
    root_password: Option<String>,

    /// Generate a root password and write it to out/root-password.txt (default)
    #[arg(long, conflicts_with = "lock_root")]
    generate_password: bool,

    /// Lock the root account (console-only image)
    #[arg(long)]
    lock_root: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StepArg {
    Prepare,
    Fetch,
    Install,
    Configure,
    Build,
    Cleanup,
    All,
}

impl StepArg {
    fn request(self) -> StepRequest {
        match self {
            StepArg::Prepare => StepRequest::Single(Step::Prepare),
            StepArg::Fetch => StepRequest::Single(Step::Fetch),
            StepArg::Install => StepRequest::Single(Step::Install),
            StepArg::Configure => StepRequest::Single(Step::Configure),
            StepArg::Build => StepRequest::Single(Step::Build),
            StepArg::Cleanup => StepRequest::Single(Step::Cleanup),
            StepArg::All => StepRequest::All,
        }
    }
}

impl Cli {
    fn features(&self) -> FeatureSet {
        let mut features = if self.minimal {
            FeatureSet::minimal()
        } else {
            FeatureSet::default()
        };
        toggle(&mut features.zfs, self.with_zfs, self.without_zfs);
        toggle(&mut features.btrfs, self.with_btrfs, self.without_btrfs);
        toggle(
            &mut features.recovery_tools,
            self.with_recovery_tools,
            self.without_recovery_tools,
        );
        toggle(
            &mut features.network_tools,
            self.with_network_tools,
            self.without_network_tools,
        );
        toggle(&mut features.crypto, self.with_crypto, self.without_crypto);
        toggle(&mut features.tui, self.with_tui, self.without_tui);
        toggle(
            &mut features.compression,
            self.with_compression,
            self.without_compression,
        );
        features
    }

    fn password(&self) -> PasswordPolicy {
        if let Some(password) = &self.root_password {
            PasswordPolicy::Explicit(password.clone())
        } else if self.lock_root {
            PasswordPolicy::LockRoot
        } else {
            PasswordPolicy::Generate
        }
    }
}

fn toggle(field: &mut bool, with: bool, without: bool) {
    if with {
        *field = true;
    } else if without {
        *field = false;
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config {
        workdir: cli.workdir.clone(),
        cache_dir: cli
            .cache_dir
            .clone()
            .unwrap_or_else(Config::default_cache_dir),
        kconfig_dir: cli.kconfig_dir.clone(),
        features: cli.features(),
        jobs: cli.jobs,
        use_swap: cli.use_swap,
        use_cache: cli.use_cache,
        verbose: cli.verbose,
        clean_start: cli.clean_start,
        clean_end: cli.clean_end,
        skip_prepare: cli.skip_prepare,
        password: cli.password(),
    };

    let profile = environment::classify();

    let result = Pipeline::new(config, profile)
        .and_then(|pipeline| pipeline.run(cli.step.request(), cli.resume));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
