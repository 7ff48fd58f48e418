//! Safe-apply state machine
//!
//! `apply` validates a candidate ruleset, loads it and arms a rollback job
//! that reloads the known-good rules after a delay. `confirm` cancels that job
//! and promotes the candidate to known-good. If nobody confirms, the external
//! scheduler fires the rollback on its own and this module plays no part.
//!
//! Both entry points return structured outcomes instead of errors so a remote
//! operator always learns exactly which side effects happened.

use crate::core::error::{Error, Result};
use crate::core::filter::{FilterController, FilterState};
use crate::core::scheduler::{Delay, JobHandle, RollbackCommand, RollbackScheduler};
use crate::core::store::{LocationKind, Promotion, RuleStore, RulesetLocation};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Host-scoped settings the coordinator is built with
#[derive(Debug, Clone)]
pub struct SafeApplyConfig {
    /// Rules the rollback job reloads
    pub known_good: RulesetLocation,
}

impl SafeApplyConfig {
    pub fn new(known_good: impl Into<RulesetLocation>) -> Self {
        Self {
            known_good: known_good.into(),
        }
    }
}

/// Where the host sits in the apply/confirm cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "armed, pending confirm")]
    ArmedPendingConfirm,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// Candidate loaded and rollback armed
    Armed {
        rules: PathBuf,
        known_good: PathBuf,
        delay: Delay,
        job: JobHandle,
        /// The filter was disabled and this apply enabled it
        started: bool,
        /// Non-fatal diagnostics from the dry run
        warnings: Vec<String>,
    },
    /// Stopped before touching the filter
    Rejected(Error),
    /// The filter refused the validated rules; no rollback was armed
    LoadFailed(Error),
    /// Candidate loaded but the safeguard could not be armed, so the filter
    /// was put back the way it was
    ArmFailed {
        error: Error,
        reverted: Result<String>,
    },
}

impl ApplyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Armed { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Armed { .. } => None,
            Self::Rejected(e) | Self::LoadFailed(e) | Self::ArmFailed { error: e, .. } => Some(e),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Armed {
                rules,
                known_good,
                delay,
                job,
                started,
                warnings,
            } => {
                let verb = if *started { "Enabled pf with" } else { "Loaded" };
                let mut message = format!(
                    "{verb} {}. Rollback job {} will reload {} in {delay}. \
                     Confirm before then or the filter automatically reverts.",
                    rules.display(),
                    job.id,
                    known_good.display()
                );
                for warning in warnings {
                    message.push_str("\n  pfctl warning: ");
                    message.push_str(warning);
                }
                message
            }
            Self::Rejected(e) => format!("Apply rejected, nothing changed: {e}"),
            Self::LoadFailed(e) => format!("Loading the candidate failed, no rollback armed: {e}"),
            Self::ArmFailed { error, reverted } => match reverted {
                Ok(_) => format!(
                    "Rollback safeguard could not be armed ({error}); \
                     the previous rules were restored"
                ),
                Err(revert) => format!(
                    "Rollback safeguard could not be armed ({error}) and restoring the \
                     previous rules failed too ({revert}). The candidate may still be loaded \
                     without a safeguard."
                ),
            },
        }
    }
}

#[derive(Debug)]
pub enum ConfirmOutcome {
    /// No safeguard was armed; nothing changed
    NothingPending,
    Confirmed {
        candidate: PathBuf,
        destination: PathBuf,
        cancelled: usize,
        promotion: Promotion,
    },
    /// Failed while the safeguard was still armed
    Failed(Error),
    /// The safeguard is gone but the candidate was not promoted
    PromoteFailed { cancelled: usize, error: Error },
}

impl ConfirmOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::NothingPending | Self::Confirmed { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::NothingPending | Self::Confirmed { .. } => None,
            Self::Failed(e) | Self::PromoteFailed { error: e, .. } => Some(e),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NothingPending => {
                "No pending rollback safeguard found; nothing to confirm".to_string()
            }
            Self::Confirmed {
                candidate,
                destination,
                promotion,
                ..
            } => {
                let archived = promotion.backup.as_ref().map_or_else(
                    || "no previous rules to archive".to_string(),
                    |b| format!("previous rules archived at {}", b.display()),
                );
                format!(
                    "Confirmed {} as known-good at {}; {archived}",
                    candidate.display(),
                    destination.display()
                )
            }
            Self::Failed(e) => format!("Confirm failed, rollback safeguard still armed: {e}"),
            Self::PromoteFailed { cancelled, error } => format!(
                "Rollback safeguard cancelled ({cancelled} job(s)) but promotion failed: {error}. \
                 No safeguard is armed now; re-apply or fix the rules manually."
            ),
        }
    }
}

/// Everything `apply` needs before it may touch the filter
struct ApplyPlan {
    rules: PathBuf,
    known_good: PathBuf,
    rollback: RollbackCommand,
    delay: Delay,
    warnings: Vec<String>,
}

/// Drives a [`FilterController`], a [`RuleStore`] and a [`RollbackScheduler`]
///
/// Assumes one apply/confirm cycle in flight per host; concurrent callers are
/// not arbitrated.
pub struct Coordinator<F, S, J> {
    filter: F,
    store: S,
    scheduler: J,
    config: SafeApplyConfig,
}

impl<F, S, J> Coordinator<F, S, J>
where
    F: FilterController,
    S: RuleStore,
    J: RollbackScheduler,
{
    pub fn new(filter: F, store: S, scheduler: J, config: SafeApplyConfig) -> Self {
        Self {
            filter,
            store,
            scheduler,
            config,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn scheduler(&self) -> &J {
        &self.scheduler
    }

    pub fn config(&self) -> &SafeApplyConfig {
        &self.config
    }

    /// Loads `candidate` and arms the rollback to the known-good rules.
    pub async fn apply(&self, candidate: &RulesetLocation, delay: &str) -> ApplyOutcome {
        let plan = match self.prepare(candidate, delay).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Apply of {candidate} rejected: {e}");
                return ApplyOutcome::Rejected(e);
            }
        };

        let previous = match self.filter.status().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot query filter status, not applying: {e}");
                return ApplyOutcome::Rejected(e);
            }
        };

        let loaded = if previous.is_enabled() {
            self.filter.reload(&plan.rules).await
        } else {
            self.filter.enable(&plan.rules).await
        };
        if let Err(e) = loaded {
            error!("Loading {} failed: {e}", plan.rules.display());
            return ApplyOutcome::LoadFailed(e);
        }

        match self.scheduler.arm(&plan.delay, &plan.rollback).await {
            Ok(job) => {
                info!(
                    "Applied {}; rollback to {} armed for {}",
                    plan.rules.display(),
                    plan.known_good.display(),
                    plan.delay
                );
                ApplyOutcome::Armed {
                    rules: plan.rules,
                    known_good: plan.known_good,
                    delay: plan.delay,
                    job,
                    started: !previous.is_enabled(),
                    warnings: plan.warnings,
                }
            }
            Err(error) => {
                error!("Arming rollback failed after load: {error}");
                let reverted = self.revert(previous, &plan.known_good).await;
                ApplyOutcome::ArmFailed { error, reverted }
            }
        }
    }

    /// Resolves both rulesets, parses the delay and validates the candidate.
    /// Nothing here mutates the filter.
    async fn prepare(&self, candidate: &RulesetLocation, delay: &str) -> Result<ApplyPlan> {
        let rules = candidate.resolve()?;
        let known_good = std::path::absolute(self.config.known_good.resolve()?)?;
        let delay = self.scheduler.parse_delay(delay)?;
        let verified = self.filter.validate(&rules).await?;
        for warning in &verified.warnings {
            warn!("pfctl: {warning}");
        }

        Ok(ApplyPlan {
            rollback: self.filter.load_command(&known_good),
            rules,
            known_good,
            delay,
            warnings: verified.warnings,
        })
    }

    /// Compensates a load that ended up without a safeguard.
    async fn revert(&self, previous: FilterState, known_good: &Path) -> Result<String> {
        let result = match previous {
            FilterState::Enabled => self.filter.reload(known_good).await,
            FilterState::Disabled => self.filter.disable().await,
        };
        match &result {
            Ok(_) => info!("Restored previous filter state ({previous})"),
            Err(e) => error!("Restoring previous filter state failed: {e}"),
        }
        result
    }

    /// Cancels the rollback, then promotes `candidate` to `destination`.
    pub async fn confirm(
        &self,
        candidate: &RulesetLocation,
        destination: &RulesetLocation,
    ) -> ConfirmOutcome {
        match self.scheduler.pending_count().await {
            Ok(0) => {
                info!("Confirm requested with no pending safeguard");
                return ConfirmOutcome::NothingPending;
            }
            Ok(1) => {}
            Ok(n) => {
                return ConfirmOutcome::Failed(Error::Precondition(format!(
                    "more than one rollback job pending ({n}); remove the extra jobs by hand"
                )));
            }
            Err(e) => return ConfirmOutcome::Failed(e),
        }

        if let Err(e) = check_promotable(candidate, destination) {
            warn!("Not confirming: {e}");
            return ConfirmOutcome::Failed(e);
        }

        // The rollback must be gone before the known-good files change
        let cancelled = match self.scheduler.cancel().await {
            Ok(n) => n,
            Err(e) => {
                error!("Cancelling rollback failed: {e}");
                return ConfirmOutcome::Failed(e);
            }
        };

        match self.store.promote(candidate, destination) {
            Ok(promotion) => {
                info!("Confirmed {candidate} as {destination}");
                ConfirmOutcome::Confirmed {
                    candidate: candidate.path().to_path_buf(),
                    destination: destination.path().to_path_buf(),
                    cancelled,
                    promotion,
                }
            }
            Err(error) => {
                error!("Safeguard cancelled but promotion failed: {error}");
                ConfirmOutcome::PromoteFailed { cancelled, error }
            }
        }
    }

    /// Enables the filter with `rules` only when it is not already running.
    /// Returns whether it had to be started.
    pub async fn ensure_running(&self, rules: &RulesetLocation) -> Result<bool> {
        let rules = rules.resolve()?;
        if self.filter.status().await?.is_enabled() {
            return Ok(false);
        }
        self.filter.enable(&rules).await?;
        Ok(true)
    }

    pub async fn enable(&self, rules: &RulesetLocation) -> Result<String> {
        self.filter.enable(&rules.resolve()?).await
    }

    pub async fn reload(&self, rules: &RulesetLocation) -> Result<String> {
        self.filter.reload(&rules.resolve()?).await
    }

    pub async fn disable(&self) -> Result<String> {
        self.filter.disable().await
    }

    pub async fn status(&self) -> Result<FilterState> {
        self.filter.status().await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.scheduler.pending_count().await
    }

    pub async fn phase(&self) -> Result<Phase> {
        match self.scheduler.pending_count().await? {
            0 => Ok(Phase::Idle),
            1 => Ok(Phase::ArmedPendingConfirm),
            n => Err(Error::Precondition(format!(
                "more than one rollback job pending ({n})"
            ))),
        }
    }
}

fn check_promotable(candidate: &RulesetLocation, destination: &RulesetLocation) -> Result<()> {
    let candidate_kind = candidate.kind();
    let destination_kind = destination.kind();
    if candidate_kind == LocationKind::Missing {
        return Err(Error::NotFound(candidate.path().to_path_buf()));
    }
    if destination_kind != LocationKind::Missing && destination_kind != candidate_kind {
        return Err(Error::Precondition(format!(
            "cannot promote {candidate_kind} {candidate} over {destination_kind} {destination}"
        )));
    }
    Ok(())
}
