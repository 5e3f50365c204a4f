//! Build step: compile the kernel (and ZFS), assemble the bootable ISO.
//!
//! This is the expensive step, so the resource plan is recomputed right
//! before compilation, and again after a swap file is brought up, since
//! swap changes what the host can afford. Verbose runs stream compiler
//! output; quiet runs capture it so failures can be classified into
//! actionable resource-exhaustion hints.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::artifact;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::environment::EnvironmentProfile;
use crate::pipeline::fetch::recorded_kernel_version;
use crate::preflight::command_exists;
use crate::process::{ensure_exists, Cmd};
use crate::resources::{ResourcePlan, ResourcePlanner};

const ISO_FILENAME: &str = "rescue.iso";
const SQUASHFS_FILENAME: &str = "rescue.squashfs";

pub fn run(
    config: &Config,
    profile: &EnvironmentProfile,
    planner: &ResourcePlanner,
    cache: &CacheManager,
) -> Result<()> {
    let kernel_src = config.kernel_dir();
    let build_dir = config.kernel_build_dir();
    let rootfs = config.rootfs_dir();
    ensure_exists(&build_dir.join(".config"), "kernel config (run the configure step first)")?;
    ensure_exists(&rootfs, "rootfs (run the install step first)")?;

    let version = recorded_kernel_version(config)?;

    let mut plan = planner.plan()?;
    let _swap = planner.ensure_swap(&plan, &config.workdir)?;
    if _swap.is_some() {
        // Swap changed the memory situation; replan before committing to
        // a thread count.
        plan = planner.plan()?;
    }
    println!(
        "  Compiling linux-{} with {} threads ({})",
        version, plan.thread_count, plan.compiler_flags
    );

    let ccache_dir = if cache.enabled() && cache.ccache_dir().is_dir() && command_exists("ccache") {
        Some(cache.ccache_dir())
    } else {
        None
    };

    build_kernel(config, &plan, ccache_dir.as_deref())?;
    install_modules(config, &rootfs)?;

    if config.features.zfs {
        build_zfs(config, &plan, &rootfs)?;
    }

    if config.features.compression {
        compress_rootfs_binaries(&rootfs);
    }

    assemble_iso(config, profile)?;
    Ok(())
}

fn make_cmd(config: &Config, plan: &ResourcePlan, ccache_dir: Option<&Path>) -> Cmd {
    let mut cmd = Cmd::new("make")
        .args(["-C", &config.kernel_dir().to_string_lossy()])
        .arg(format!("O={}", config.kernel_build_dir().display()))
        .arg(plan.jobs_arg())
        .arg(format!("KCFLAGS={}", plan.compiler_flags));
    if let Some(dir) = ccache_dir {
        cmd = cmd
            .arg("CC=ccache gcc")
            .env("CCACHE_DIR", dir.to_string_lossy());
    }
    cmd
}

fn build_kernel(config: &Config, plan: &ResourcePlan, ccache_dir: Option<&Path>) -> Result<()> {
    let cmd = make_cmd(config, plan, ccache_dir)
        .args(["bzImage", "modules"])
        .error_msg("kernel build failed");
    run_build(config, cmd)
}

fn install_modules(config: &Config, rootfs: &Path) -> Result<()> {
    Cmd::new("make")
        .args(["-C", &config.kernel_dir().to_string_lossy()])
        .arg(format!("O={}", config.kernel_build_dir().display()))
        .arg(format!("INSTALL_MOD_PATH={}", rootfs.display()))
        .arg("modules_install")
        .error_msg("kernel modules_install failed")
        .run()?;
    Ok(())
}

fn build_zfs(config: &Config, plan: &ResourcePlan, rootfs: &Path) -> Result<()> {
    let zfs = config.zfs_dir();
    ensure_exists(&zfs.join("configure"), "OpenZFS source (run the fetch step first)")?;
    println!("  Building OpenZFS against the new kernel");

    Cmd::new("./configure")
        .arg(format!("--with-linux={}", config.kernel_dir().display()))
        .arg(format!("--with-linux-obj={}", config.kernel_build_dir().display()))
        .current_dir(&zfs)
        .error_msg("OpenZFS configure failed")
        .run()?;

    let cmd = Cmd::new("make")
        .arg(plan.jobs_arg())
        .current_dir(&zfs)
        .error_msg("OpenZFS build failed");
    run_build(config, cmd)?;

    Cmd::new("make")
        .arg("install")
        .arg(format!("DESTDIR={}", rootfs.display()))
        .current_dir(&zfs)
        .error_msg("OpenZFS install into rootfs failed")
        .run()?;
    Ok(())
}

/// Quiet runs capture output so OOM/disk-full signatures are rewritten
/// into remediation hints; verbose runs stream it.
fn run_build(config: &Config, cmd: Cmd) -> Result<()> {
    if config.verbose {
        cmd.run_interactive()
    } else {
        cmd.run().map(|_| ())
    }
}

/// Best effort: a failed upx never fails the build.
fn compress_rootfs_binaries(rootfs: &Path) {
    if !command_exists("upx") {
        eprintln!("  [WARN] upx not installed; skipping binary compression");
        return;
    }
    for rel in ["bin/busybox", "usr/bin/busybox"] {
        let target = rootfs.join(rel);
        if !target.is_file() {
            continue;
        }
        match Cmd::new("upx").args(["--best", "-q"]).arg_path(&target).run() {
            Ok(_) => println!("  Compressed {}", rel),
            Err(e) => eprintln!("  [WARN] upx on {} failed: {:#}", rel, e),
        }
        break;
    }
}

fn assemble_iso(config: &Config, _profile: &EnvironmentProfile) -> Result<()> {
    let iso_root = config.iso_dir();
    artifact::setup_iso_structure(&iso_root)?;

    let bzimage = config
        .kernel_build_dir()
        .join("arch/x86/boot/bzImage");
    ensure_exists(&bzimage, "built kernel image")?;
    fs::copy(&bzimage, iso_root.join(artifact::ISO_BOOT_DIR).join("vmlinuz"))
        .context("staging kernel into ISO")?;

    build_initramfs(config, &iso_root.join(artifact::ISO_BOOT_DIR).join("initramfs.gz"))?;

    println!("  Squashing rootfs...");
    artifact::build_squashfs(
        &config.rootfs_dir(),
        &iso_root.join(artifact::ISO_LIVE_DIR).join(SQUASHFS_FILENAME),
    )?;

    let out = config.out_dir();
    fs::create_dir_all(&out)?;
    let iso_path = out.join(ISO_FILENAME);
    println!("  Writing {}...", iso_path.display());
    artifact::run_xorriso(&iso_root, &iso_path, artifact::ISO_LABEL)?;
    artifact::generate_iso_checksum(&iso_path)?;

    println!("  Image ready: {}", iso_path.display());
    Ok(())
}

/// Minimal initramfs: busybox plus an init that mounts the live medium
/// and pivots onto the squashfs with a tmpfs overlay.
fn build_initramfs(config: &Config, output: &Path) -> Result<()> {
    let staging = config.workdir.join("initramfs");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    for sub in ["bin", "dev", "proc", "sys", "mnt/cdrom", "mnt/root"] {
        fs::create_dir_all(staging.join(sub))?;
    }

    let busybox = ["bin/busybox", "usr/bin/busybox"]
        .iter()
        .map(|rel| config.rootfs_dir().join(rel))
        .find(|p| p.is_file())
        .context("busybox not found in rootfs; did the install step run?")?;
    fs::copy(&busybox, staging.join("bin/busybox"))?;

    let init = staging.join("init");
    fs::write(&init, init_script())?;
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&init)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&init, perms)?;
        let mut perms = fs::metadata(staging.join("bin/busybox"))?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(staging.join("bin/busybox"), perms)?;
    }

    // newc cpio is what the kernel unpacks; busybox find/cpio/gzip are
    // not guaranteed on the host, so the host tools drive this.
    Cmd::new("sh")
        .arg("-c")
        .arg(format!(
            "find . | cpio -o -H newc --quiet | gzip -9 > '{}'",
            output.display()
        ))
        .current_dir(&staging)
        .error_msg("packing initramfs failed")
        .run()?;
    Ok(())
}

fn init_script() -> &'static str {
    concat!(
        "#!/bin/busybox sh\n",
        "/bin/busybox --install -s /bin\n",
        "mount -t devtmpfs dev /dev\n",
        "mount -t proc proc /proc\n",
        "mount -t sysfs sys /sys\n",
        "for i in 1 2 3 4 5; do\n",
        "    cdrom=$(findfs LABEL=RESCUE 2>/dev/null) && break\n",
        "    sleep 1\n",
        "done\n",
        "mount -o ro \"$cdrom\" /mnt/cdrom\n",
        "mount -t tmpfs -o size=75% tmpfs /mnt/root\n",
        "mkdir -p /mnt/root/ro /mnt/root/rw /mnt/root/work /mnt/root/merged\n",
        "mount -o loop /mnt/cdrom/live/rescue.squashfs /mnt/root/ro\n",
        "mount -t overlay -o lowerdir=/mnt/root/ro,upperdir=/mnt/root/rw,workdir=/mnt/root/work \\\n",
        "    overlay /mnt/root/merged\n",
        "umount /proc /sys\n",
        "exec switch_root /mnt/root/merged /sbin/init\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_script_mounts_the_labelled_medium() {
        let script = init_script();
        assert!(script.starts_with("#!/bin/busybox sh"));
        assert!(script.contains("LABEL=RESCUE"));
        assert!(script.contains("switch_root"));
    }
}
