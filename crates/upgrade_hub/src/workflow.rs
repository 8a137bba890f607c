//! Drives one step through its substeps, recording progress as it goes.

use async_trait::async_trait;
use upgrade_core::step::{Status, Step, StepTracker, Substep};
use upgrade_core::FaultInjector;

use crate::agents::StepError;

/// Simulates a crash after a substep's work finished but before it was
/// recorded as complete.
pub const AFTER_SUBSTEP: &str = "workflow.after_substep";

/// The work behind each substep.
#[async_trait]
pub trait SubstepRunner: Send + Sync {
    async fn run(&self, step: Step, substep: Substep) -> Result<(), StepError>;
}

/// Execute `step`, skipping substeps already complete from an earlier run.
///
/// The first failing substep is recorded as failed with its full error and
/// ends the step. Substeps after it stay pending.
pub async fn run_step(
    tracker: &mut StepTracker,
    faults: &FaultInjector,
    step: Step,
    runner: &dyn SubstepRunner,
) -> Result<(), StepError> {
    tracker.begin(step).map_err(StepError::Store)?;

    for &substep in step.substeps() {
        if tracker.status(step, substep) == Status::Complete {
            tracing::info!(step = %step, substep = %substep, "substep already complete; skipping");
            tracker.announce(step, substep, Status::Complete);
            continue;
        }

        tracker
            .transition(step, substep, Status::Running, None)
            .map_err(StepError::Store)?;
        tracing::info!(step = %step, substep = %substep, "substep running");

        let result = runner.run(step, substep).await;

        if result.is_ok() && faults.fire(AFTER_SUBSTEP) {
            // Leave the substep `running`, as a crash at this point would.
            return Err(StepError::Injected {
                substep,
                point: AFTER_SUBSTEP.to_string(),
            });
        }

        match result {
            Ok(()) => {
                tracker
                    .transition(step, substep, Status::Complete, None)
                    .map_err(StepError::Store)?;
                tracing::info!(step = %step, substep = %substep, "substep complete");
            }
            Err(err) => {
                tracing::error!(step = %step, substep = %substep, error = %err, "substep failed");
                tracker
                    .transition(step, substep, Status::Failed, Some(err.to_string()))
                    .map_err(StepError::Store)?;
                return Err(err);
            }
        }
    }

    tracing::info!(step = %step, "step complete");
    Ok(())
}
