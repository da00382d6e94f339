//! Periodic sweeps over live sandboxes.
//!
//! Each sweep walks the sandbox table a page per tick, keeping its own
//! cursor, and wraps around when it reaches the end. Candidates come from an
//! unlocked listing, so every action re-checks the row under the sandbox lock
//! in try mode and skips sandboxes that are busy.

use std::sync::Arc;

use {
    async_trait::async_trait,
    corral_common::{Tick, now_ms},
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use crate::{
    Result,
    manager::SandboxManager,
    types::{BackupState, DesiredState, Sandbox, SandboxState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    AutoStop,
    AutoArchive,
    AutoDelete,
    Backup,
    /// Re-drive every live sandbox towards its desired state, picking up
    /// work that found no capacity or was interrupted.
    Reconcile,
}

impl SweepKind {
    pub const ALL: [Self; 5] = [
        Self::AutoStop,
        Self::AutoArchive,
        Self::AutoDelete,
        Self::Backup,
        Self::Reconcile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoStop => "auto-stop",
            Self::AutoArchive => "auto-archive",
            Self::AutoDelete => "auto-delete",
            Self::Backup => "backup",
            Self::Reconcile => "reconcile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    SetDesired(DesiredState),
    Backup,
    Reconcile,
}

fn minutes_ms(minutes: u64) -> u64 {
    minutes.saturating_mul(60_000)
}

fn elapsed(since_ms: u64, now: u64, limit_ms: u64) -> bool {
    now.saturating_sub(since_ms) > limit_ms
}

fn auto_stop(sandbox: &Sandbox, now: u64) -> Option<DesiredState> {
    let due = sandbox.state == SandboxState::Started
        && sandbox.desired_state == DesiredState::Started
        && sandbox.pool_id.is_none()
        && sandbox.auto_stop_minutes > 0
        && elapsed(
            sandbox.last_activity_at_ms,
            now,
            minutes_ms(u64::from(sandbox.auto_stop_minutes)),
        );
    due.then(|| {
        if sandbox.auto_delete_minutes == 0 {
            DesiredState::Destroyed
        } else {
            DesiredState::Stopped
        }
    })
}

fn auto_archive(sandbox: &Sandbox, now: u64) -> Option<DesiredState> {
    let due = sandbox.state == SandboxState::Stopped
        && sandbox.desired_state == DesiredState::Stopped
        && sandbox.pool_id.is_none()
        && sandbox.auto_archive_minutes > 0
        && elapsed(
            sandbox.state_changed_at_ms,
            now,
            minutes_ms(u64::from(sandbox.auto_archive_minutes)),
        );
    due.then_some(DesiredState::Archived)
}

fn auto_delete(sandbox: &Sandbox, now: u64) -> Option<DesiredState> {
    let Ok(minutes) = u64::try_from(sandbox.auto_delete_minutes) else {
        return None;
    };
    let due = sandbox.state == SandboxState::Stopped
        && sandbox.desired_state == DesiredState::Stopped
        && sandbox.pool_id.is_none()
        && elapsed(sandbox.last_activity_at_ms, now, minutes_ms(minutes));
    due.then_some(DesiredState::Destroyed)
}

fn backup_due(sandbox: &Sandbox, now: u64, max_age_ms: u64) -> bool {
    sandbox.state == SandboxState::Started
        && sandbox.desired_state == DesiredState::Started
        && sandbox.pool_id.is_none()
        && !matches!(
            sandbox.backup_state,
            BackupState::Pending | BackupState::InProgress
        )
        && elapsed(
            sandbox.last_backup_at_ms.unwrap_or(sandbox.created_at_ms),
            now,
            max_age_ms,
        )
}

fn decide(kind: SweepKind, sandbox: &Sandbox, now: u64, backup_max_age_ms: u64) -> Option<SweepAction> {
    match kind {
        SweepKind::AutoStop => auto_stop(sandbox, now).map(SweepAction::SetDesired),
        SweepKind::AutoArchive => auto_archive(sandbox, now).map(SweepAction::SetDesired),
        SweepKind::AutoDelete => auto_delete(sandbox, now).map(SweepAction::SetDesired),
        SweepKind::Backup => backup_due(sandbox, now, backup_max_age_ms).then_some(SweepAction::Backup),
        SweepKind::Reconcile => Some(SweepAction::Reconcile),
    }
}

/// One sweep with its own cursor over the sandbox table.
pub struct Sweep {
    kind: SweepKind,
    manager: Arc<SandboxManager>,
    page_size: usize,
    cursor: Mutex<Option<String>>,
}

impl Sweep {
    pub fn new(kind: SweepKind, manager: Arc<SandboxManager>, page_size: usize) -> Self {
        Self {
            kind,
            manager,
            page_size: page_size.max(1),
            cursor: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    /// Examine the next page. Returns how many sandboxes were acted on.
    pub async fn run_page(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let page = self
            .manager
            .store()
            .list_page(cursor.as_deref(), self.page_size)
            .await?;
        *cursor = if page.len() < self.page_size {
            None
        } else {
            page.last().map(|s| s.id.clone())
        };
        drop(cursor);

        let max_age_ms = self.manager.backup_config().max_age_secs.saturating_mul(1_000);
        let mut acted = 0;
        for sandbox in page {
            let now = now_ms();
            let Some(action) = decide(self.kind, &sandbox, now, max_age_ms) else {
                continue;
            };
            match self.apply(&sandbox.id, action).await {
                Ok(true) => acted += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!(sweep = self.kind.as_str(), sandbox_id = %sandbox.id, error = %e, "sweep action failed");
                },
            }
        }
        Ok(acted)
    }

    async fn apply(&self, id: &str, action: SweepAction) -> Result<bool> {
        let kind = self.kind;
        let acted = match action {
            SweepAction::SetDesired(_) => self
                .manager
                .try_transition(id, move |fresh| {
                    let now = now_ms();
                    match decide(kind, fresh, now, 0) {
                        Some(SweepAction::SetDesired(desired)) => Some(desired),
                        _ => None,
                    }
                })
                .await?
                .is_some(),
            SweepAction::Backup => self.manager.try_request_backup(id).await?.is_some(),
            SweepAction::Reconcile => self.manager.try_reconcile(id).await?.is_some(),
        };
        Ok(acted)
    }
}

#[async_trait]
impl Tick for Sweep {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn tick(&self) {
        match self.run_page().await {
            Ok(0) => {},
            Ok(acted) => debug!(sweep = self.kind.as_str(), acted, "sweep page done"),
            Err(e) => warn!(sweep = self.kind.as_str(), error = %e, "sweep failed"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::NewSandbox};

    const HOUR: u64 = 3_600_000;

    fn sandbox(state: SandboxState, desired: DesiredState) -> Sandbox {
        let mut s = NewSandbox::new("org", "s", "eu").into_sandbox();
        s.state = state;
        s.desired_state = desired;
        s.last_activity_at_ms = 0;
        s.state_changed_at_ms = 0;
        s.created_at_ms = 0;
        s
    }

    #[test]
    fn idle_started_sandbox_is_stopped() {
        let mut s = sandbox(SandboxState::Started, DesiredState::Started);
        s.auto_stop_minutes = 15;
        assert_eq!(auto_stop(&s, 14 * 60_000), None);
        assert_eq!(auto_stop(&s, 16 * 60_000), Some(DesiredState::Stopped));

        s.auto_delete_minutes = 0;
        assert_eq!(auto_stop(&s, 16 * 60_000), Some(DesiredState::Destroyed));

        s.auto_stop_minutes = 0;
        assert_eq!(auto_stop(&s, HOUR), None);
    }

    #[test]
    fn pool_members_are_exempt() {
        let mut s = sandbox(SandboxState::Started, DesiredState::Started);
        s.auto_stop_minutes = 1;
        s.pool_id = Some("pool".into());
        assert_eq!(auto_stop(&s, HOUR), None);
        assert!(!backup_due(&s, 10 * HOUR, HOUR));
    }

    #[test]
    fn archive_counts_from_the_stop() {
        let mut s = sandbox(SandboxState::Stopped, DesiredState::Stopped);
        s.auto_archive_minutes = 60;
        s.state_changed_at_ms = HOUR;
        assert_eq!(auto_archive(&s, HOUR + 30 * 60_000), None);
        assert_eq!(auto_archive(&s, 2 * HOUR + 1), Some(DesiredState::Archived));
    }

    #[test]
    fn negative_auto_delete_disables() {
        let mut s = sandbox(SandboxState::Stopped, DesiredState::Stopped);
        assert_eq!(auto_delete(&s, 100 * HOUR), None);
        s.auto_delete_minutes = 30;
        assert_eq!(auto_delete(&s, 31 * 60_000), Some(DesiredState::Destroyed));
    }

    #[test]
    fn backup_waits_for_max_age_and_in_flight_backups() {
        let mut s = sandbox(SandboxState::Started, DesiredState::Started);
        assert!(!backup_due(&s, HOUR / 2, HOUR));
        assert!(backup_due(&s, 2 * HOUR, HOUR));
        s.last_backup_at_ms = Some(2 * HOUR);
        assert!(!backup_due(&s, 2 * HOUR + 1, HOUR));
        s.last_backup_at_ms = None;
        s.backup_state = BackupState::InProgress;
        assert!(!backup_due(&s, 2 * HOUR, HOUR));
    }
}
