//! Pipeline executor.
//!
//! Drives the fixed step order, consults the checkpoint store to decide
//! where to resume, and records progress after each step commits. Steps
//! run strictly sequentially; each one mutates shared on-disk state (the
//! rootfs, the kernel tree) that the next depends on. A full `all` run
//! covers prepare through build; cleanup runs on explicit request or
//! with `--clean-end`.

mod build;
mod cleanup;
mod configure;
mod fetch;
mod install;
mod prepare;

use anyhow::{bail, Result};

use crate::cache::CacheManager;
use crate::checkpoint::{Checkpoint, CheckpointStore, Step};
use crate::config::Config;
use crate::environment::EnvironmentProfile;
use crate::errlog::ErrorLog;
use crate::resources::ResourcePlanner;

/// What the CLI asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRequest {
    Single(Step),
    All,
}

/// Decide which steps a request executes, honoring the transition rule:
/// a step may only start if the checkpoint is unset or equals the step
/// immediately preceding it.
pub fn steps_to_run(
    request: StepRequest,
    resume: bool,
    checkpoint: Option<&Checkpoint>,
    skip_prepare: bool,
) -> Result<Vec<Step>> {
    match request {
        StepRequest::Single(step) => {
            validate_single(step, checkpoint)?;
            Ok(vec![step])
        }
        StepRequest::All => {
            let first = if resume {
                match checkpoint {
                    None => Step::Prepare,
                    Some(cp) => match cp.last_completed_step.successor() {
                        // Resuming past build means there is nothing left.
                        Some(next) if next <= Step::Build => next,
                        _ => return Ok(Vec::new()),
                    },
                }
            } else if skip_prepare {
                Step::Fetch
            } else {
                Step::Prepare
            };

            Ok(Step::ALL
                .into_iter()
                .filter(|s| *s >= first && *s <= Step::Build)
                .collect())
        }
    }
}

fn validate_single(step: Step, checkpoint: Option<&Checkpoint>) -> Result<()> {
    // Prepare starts a fresh run and cleanup is always safe to invoke.
    if matches!(step, Step::Prepare | Step::Cleanup) {
        return Ok(());
    }
    let predecessor = step.predecessor();
    let last = checkpoint.map(|cp| cp.last_completed_step);
    if last == predecessor {
        return Ok(());
    }
    match last {
        Some(done) => bail!(
            "cannot run step '{}': last completed step is '{}', expected '{}'\n  \
             Run 'rescue-builder all --resume' to continue in order",
            step,
            done,
            predecessor.map(|s| s.name()).unwrap_or("none")
        ),
        None => bail!(
            "cannot run step '{}' on a fresh pipeline: its predecessor '{}' has not completed\n  \
             Run 'rescue-builder all' to start from the beginning",
            step,
            predecessor.map(|s| s.name()).unwrap_or("none")
        ),
    }
}

/// The top-level driver. Collaborators are injected at construction and
/// shared by every step.
pub struct Pipeline {
    config: Config,
    profile: EnvironmentProfile,
    planner: ResourcePlanner,
    cache: CacheManager,
    checkpoints: CheckpointStore,
    errlog: ErrorLog,
}

impl Pipeline {
    pub fn new(config: Config, profile: EnvironmentProfile) -> Result<Self> {
        let planner = ResourcePlanner::new(profile, config.jobs, config.use_swap);
        let cache = CacheManager::open(&config.cache_dir, config.use_cache)?;
        let checkpoints = CheckpointStore::new(&config.workdir);
        let errlog = ErrorLog::new(&config.workdir);
        Ok(Self {
            config,
            profile,
            planner,
            cache,
            checkpoints,
            errlog,
        })
    }

    pub fn run(&self, request: StepRequest, resume: bool) -> Result<()> {
        let checkpoint = self.checkpoints.load()?;
        let steps = steps_to_run(request, resume, checkpoint.as_ref(), self.config.skip_prepare)?;

        if steps.is_empty() {
            println!("Nothing to do: pipeline already completed through build.");
            return Ok(());
        }

        if let Some(cp) = &checkpoint {
            if resume {
                println!(
                    "Resuming after '{}' (completed {})",
                    cp.last_completed_step, cp.timestamp
                );
            }
        }

        for step in steps {
            self.execute(step)?;
        }

        if self.config.clean_end && request == StepRequest::All {
            self.execute(Step::Cleanup)?;
        }

        Ok(())
    }

    fn execute(&self, step: Step) -> Result<()> {
        println!("==> {}", step);
        let result = match step {
            Step::Prepare => prepare::run(&self.config, &self.profile, &self.cache),
            Step::Fetch => fetch::run(&self.config, &self.profile, &self.cache),
            Step::Install => install::run(&self.config, &self.profile),
            Step::Configure => configure::run(&self.config, &self.planner),
            Step::Build => build::run(&self.config, &self.profile, &self.planner, &self.cache),
            Step::Cleanup => cleanup::run(&self.config, &self.profile, &self.checkpoints),
        };

        match result {
            Ok(()) => {
                // Cleanup clears the checkpoint itself; recording it
                // would immediately recreate stale state.
                if step != Step::Cleanup {
                    self.checkpoints.record(step)?;
                }
                println!("==> {} done", step);
                Ok(())
            }
            Err(e) => {
                self.errlog.append_best_effort(step.name(), &format!("{:#}", e));
                eprintln!("==> {} FAILED", step);
                eprintln!(
                    "    Checkpoint remains at the last completed step; after fixing the\n    \
                     cause, re-run: rescue-builder all --resume"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(step: Step) -> Checkpoint {
        Checkpoint {
            last_completed_step: step,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn fresh_all_runs_prepare_through_build() {
        let steps = steps_to_run(StepRequest::All, false, None, false).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Prepare,
                Step::Fetch,
                Step::Install,
                Step::Configure,
                Step::Build
            ]
        );
    }

    #[test]
    fn all_without_resume_restarts_even_with_checkpoint() {
        let checkpoint = cp(Step::Configure);
        let steps = steps_to_run(StepRequest::All, false, Some(&checkpoint), false).unwrap();
        assert_eq!(steps[0], Step::Prepare);
    }

    #[test]
    fn resume_runs_exactly_the_remaining_steps() {
        let checkpoint = cp(Step::Install);
        let steps = steps_to_run(StepRequest::All, true, Some(&checkpoint), false).unwrap();
        assert_eq!(steps, vec![Step::Configure, Step::Build]);
    }

    #[test]
    fn resume_after_build_has_nothing_to_do() {
        let checkpoint = cp(Step::Build);
        let steps = steps_to_run(StepRequest::All, true, Some(&checkpoint), false).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn resume_on_fresh_pipeline_starts_at_prepare() {
        let steps = steps_to_run(StepRequest::All, true, None, false).unwrap();
        assert_eq!(steps[0], Step::Prepare);
    }

    #[test]
    fn skip_prepare_starts_at_fetch() {
        let steps = steps_to_run(StepRequest::All, false, None, true).unwrap();
        assert_eq!(steps[0], Step::Fetch);
    }

    #[test]
    fn single_step_requires_predecessor_checkpoint() {
        let checkpoint = cp(Step::Install);
        let steps =
            steps_to_run(StepRequest::Single(Step::Configure), false, Some(&checkpoint), false)
                .unwrap();
        assert_eq!(steps, vec![Step::Configure]);

        let checkpoint = cp(Step::Fetch);
        let err =
            steps_to_run(StepRequest::Single(Step::Configure), false, Some(&checkpoint), false)
                .unwrap_err();
        assert!(err.to_string().contains("expected 'install'"));
    }

    #[test]
    fn single_build_on_fresh_pipeline_is_rejected() {
        let err = steps_to_run(StepRequest::Single(Step::Build), false, None, false).unwrap_err();
        assert!(err.to_string().contains("fresh pipeline"));
    }

    #[test]
    fn prepare_and_cleanup_always_allowed() {
        for step in [Step::Prepare, Step::Cleanup] {
            let checkpoint = cp(Step::Build);
            assert!(steps_to_run(StepRequest::Single(step), false, Some(&checkpoint), false).is_ok());
            assert!(steps_to_run(StepRequest::Single(step), false, None, false).is_ok());
        }
    }
}
