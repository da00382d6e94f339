//! Desired/actual reconciliation.
//!
//! [`plan`] is pure: given a sandbox and what the manager observed around it,
//! it names the single next step towards the desired state. The manager
//! applies the step under the sandbox lock.

use {corral_jobs::JobType, corral_volumes::SnapshotState};

use crate::types::{Sandbox, SandboxState};

/// What the manager saw next to the sandbox row.
#[derive(Debug, Clone, Default)]
pub struct Facts {
    /// A non-terminal job exists for the sandbox.
    pub job_in_flight: bool,
    /// State of the snapshot a build-pending sandbox waits for; `None` when
    /// it does not exist.
    pub snapshot: Option<SnapshotState>,
    /// Sandboxes already archiving on the sandbox's runner.
    pub archiving_on_runner: usize,
    pub max_archiving_per_runner: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Converged, or blocked until something else changes.
    Idle,
    /// Enqueue `job` and move to `next` while it runs.
    Enqueue { job: JobType, next: SandboxState },
    /// Reserve a runner, then enqueue `CREATE_SANDBOX` in `next`.
    Place { next: SandboxState },
    /// Write `state` without any runner work.
    Settle(SandboxState),
    /// Park in `build_failed`.
    FailBuild(String),
}

fn enqueue(job: JobType, next: SandboxState) -> Step {
    Step::Enqueue { job, next }
}

pub fn plan(sandbox: &Sandbox, facts: &Facts) -> Step {
    use crate::types::{DesiredState as D, SandboxState as S};

    // Desired-state changes made while a job runs wait for its result.
    if facts.job_in_flight {
        return Step::Idle;
    }
    let placed = sandbox.runner_id.is_some();
    let state = sandbox.state;

    match (state, sandbox.desired_state) {
        (S::Destroyed, _) => Step::Idle,
        (_, D::Destroyed) if !placed => Step::Settle(S::Destroyed),
        (_, D::Destroyed) => enqueue(JobType::DestroySandbox, S::Destroying),

        (S::Error | S::BuildFailed | S::Unknown, _) => Step::Idle,

        (S::PendingBuild | S::BuildingSnapshot | S::PullingSnapshot, _) => {
            waiting_on_snapshot(state, facts.snapshot)
        },

        (S::Creating | S::Restoring, _) if !placed => Step::Place { next: state },
        (S::Creating | S::Restoring, _) => enqueue(JobType::CreateSandbox, state),

        // Interrupted before the job row was written; the runner side is idempotent.
        (S::Starting, _) => enqueue(JobType::StartSandbox, S::Starting),
        (S::Stopping, _) => enqueue(JobType::StopSandbox, S::Stopping),
        (S::Destroying, _) => enqueue(JobType::DestroySandbox, S::Destroying),
        (S::Resizing, _) => enqueue(JobType::ResizeSandbox, S::Resizing),
        (S::Archiving, _) => enqueue(JobType::CreateBackup, S::Archiving),

        (S::Started, D::Started) | (S::Stopped, D::Stopped) => Step::Idle,
        (S::Started, D::Stopped | D::Archived) => enqueue(JobType::StopSandbox, S::Stopping),
        (S::Started | S::Stopped, D::Resized) => enqueue(JobType::ResizeSandbox, S::Resizing),
        (S::Stopped, D::Started) => enqueue(JobType::StartSandbox, S::Starting),

        (S::Stopped | S::PendingArchive, D::Archived) => {
            if facts.archiving_on_runner < facts.max_archiving_per_runner {
                enqueue(JobType::CreateBackup, S::Archiving)
            } else if state == S::Stopped {
                Step::Settle(S::PendingArchive)
            } else {
                Step::Idle
            }
        },
        (S::PendingArchive, _) => Step::Settle(S::Stopped),

        (S::Archived, D::Started) => Step::Place { next: S::Restoring },
        (S::Archived, D::Stopped | D::Archived | D::Resized) => Step::Idle,
    }
}

fn waiting_on_snapshot(state: SandboxState, snapshot: Option<SnapshotState>) -> Step {
    let next = match snapshot {
        Some(SnapshotState::Active) => return Step::Place { next: SandboxState::Creating },
        Some(SnapshotState::BuildPending | SnapshotState::Building) => {
            SandboxState::BuildingSnapshot
        },
        Some(
            SnapshotState::Pending
            | SnapshotState::Pulling
            | SnapshotState::PendingValidation
            | SnapshotState::Validating,
        ) => SandboxState::PullingSnapshot,
        Some(other) => return Step::FailBuild(format!("snapshot is {other}")),
        None => return Step::FailBuild("snapshot not found".into()),
    };
    if next == state {
        Step::Idle
    } else {
        Step::Settle(next)
    }
}
