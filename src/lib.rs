//! Builds a bootable Alpine-based recovery ISO.
//!
//! The work is organized as a fixed, checkpointed pipeline:
//!
//! - **prepare** - host validation, working-tree layout, compiler cache
//! - **fetch** - download and extract the Alpine rootfs, kernel, OpenZFS
//! - **install** - populate the rootfs (packages, merged-/usr, password)
//! - **configure** - merge kernel config overlays and normalize them
//! - **build** - compile kernel and ZFS, assemble the ISO
//! - **cleanup** - release swap/markers, reset pipeline state
//!
//! After each step commits, a checkpoint is recorded so an interrupted
//! run resumes where it left off. Environment-sensitive operations
//! (extraction, symlinks, chroot) go through explicit strategy chains
//! that degrade gracefully across bare hosts, containers and CI.
//!
//! # Architecture
//!
//! ```text
//! rescue-builder (CLI)
//!     │
//!     └── pipeline::Pipeline ── one module per step
//!             │
//!             ├── environment  host classification (bare/docker/ci)
//!             ├── resources    threads/flags/swap planning
//!             ├── checkpoint   step order + persisted progress
//!             ├── strategy     fallback chains for privileged ops
//!             ├── cache        sources/ccache/packages partitions
//!             ├── overlay      kernel config merging
//!             └── artifact     squashfs + xorriso assembly
//! ```

pub mod artifact;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod environment;
pub mod errlog;
pub mod overlay;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resources;
pub mod strategy;
