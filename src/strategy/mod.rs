//! Fallback strategies for risky operations.
//!
//! Archive extraction, symlinking, and chroot operations behave
//! differently per environment (bare host, Docker, CI). Rather than
//! branching control flow per environment, each operation resolves to an
//! ordered list of `Strategy` values tried by a single uniform executor.
//! The first success terminates the chain; exhaustion is fatal and names
//! every attempted strategy plus the last error.

pub mod extract;
pub mod privileged;

use anyhow::{bail, Result};

/// The risky operation a strategy performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Extract,
    Symlink,
    ChrootOp,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Extract => "extract",
            Operation::Symlink => "symlink",
            Operation::ChrootOp => "chroot-op",
        }
    }
}

/// How a strategy obtains the access it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Plain invocation with the current privileges.
    Direct,
    /// Retry through sudo.
    SudoElevated,
    /// Variant tuned for container filesystems (skips ownership work
    /// that is prohibitively slow or impossible there).
    ContainerOptimized,
    /// Guaranteed-available worst case: degraded result, or a warned
    /// no-op where that is safe.
    PlaceholderFallback,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::SudoElevated => "sudo-elevated",
            StrategyKind::ContainerOptimized => "container-optimized",
            StrategyKind::PlaceholderFallback => "placeholder-fallback",
        }
    }

    /// Whether the strategy depends on external privileges being granted.
    pub fn needs_privilege(&self) -> bool {
        matches!(self, StrategyKind::SudoElevated)
    }
}

/// One concrete way to perform an operation.
pub struct Strategy {
    pub kind: StrategyKind,
    pub operation: Operation,
    /// Short human description, e.g. "parallel pigz extraction".
    pub name: String,
    action: Box<dyn FnMut() -> Result<()>>,
}

impl Strategy {
    pub fn new(
        kind: StrategyKind,
        operation: Operation,
        name: impl Into<String>,
        action: impl FnMut() -> Result<()> + 'static,
    ) -> Self {
        Self {
            kind,
            operation,
            name: name.into(),
            action: Box::new(action),
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind.name())
            .field("operation", &self.operation.name())
            .field("name", &self.name)
            .finish()
    }
}

/// Try each strategy in order until one succeeds.
///
/// Returns the name of the winning strategy. `target` names the subject
/// of the operation for error messages.
pub fn try_strategies(target: &str, mut strategies: Vec<Strategy>) -> Result<String> {
    if strategies.is_empty() {
        bail!("no strategies available for '{}'", target);
    }

    let mut attempted: Vec<String> = Vec::new();
    let mut last_error: Option<anyhow::Error> = None;
    let total = strategies.len();

    for strategy in &mut strategies {
        let label = format!("{} ({})", strategy.name, strategy.kind.name());
        match (strategy.action)() {
            Ok(()) => {
                if !attempted.is_empty() {
                    println!("  Succeeded via fallback: {}", label);
                }
                return Ok(strategy.name.clone());
            }
            Err(e) => {
                if attempted.len() + 1 < total {
                    eprintln!("  [WARN] {} failed for '{}': {:#}", label, target, e);
                }
                attempted.push(label);
                last_error = Some(e);
            }
        }
    }

    let last = last_error.map(|e| format!("{:#}", e)).unwrap_or_default();
    bail!(
        "all strategies exhausted for '{}':\n  attempted: {}\n  last error: {}",
        target,
        attempted.join(", "),
        last
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(name: &str) -> Strategy {
        Strategy::new(StrategyKind::Direct, Operation::Extract, name, || {
            bail!("forced failure")
        })
    }

    #[test]
    fn first_success_terminates_chain() {
        let hit = std::rc::Rc::new(std::cell::Cell::new(0));
        let h1 = hit.clone();
        let h2 = hit.clone();
        let strategies = vec![
            Strategy::new(StrategyKind::Direct, Operation::Extract, "first", move || {
                h1.set(h1.get() + 1);
                Ok(())
            }),
            Strategy::new(StrategyKind::Direct, Operation::Extract, "second", move || {
                h2.set(h2.get() + 100);
                Ok(())
            }),
        ];
        let winner = try_strategies("archive", strategies).unwrap();
        assert_eq!(winner, "first");
        assert_eq!(hit.get(), 1);
    }

    #[test]
    fn failure_falls_through_to_next() {
        let strategies = vec![
            failing("primary"),
            Strategy::new(StrategyKind::Direct, Operation::Extract, "secondary", || {
                Ok(())
            }),
        ];
        let winner = try_strategies("archive", strategies).unwrap();
        assert_eq!(winner, "secondary");
    }

    #[test]
    fn exhaustion_names_every_attempt() {
        let err = try_strategies("archive", vec![failing("one"), failing("two")]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("one"));
        assert!(msg.contains("two"));
        assert!(msg.contains("forced failure"));
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(try_strategies("archive", Vec::new()).is_err());
    }
}
