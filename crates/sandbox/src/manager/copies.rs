//! Forks, clones and sandbox snapshots.
//!
//! A copy is a new sandbox row placed on the source's runner with a pointer
//! back to the source. The source row is only read.

use {
    corral_jobs::{Job, JobType},
    serde_json::json,
    tracing::info,
};

use super::SandboxManager;
use crate::{
    Error, Result,
    types::{NewSandbox, Sandbox, SandboxState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyKind {
    Fork,
    Clone,
}

impl CopyKind {
    fn job_type(self) -> JobType {
        match self {
            Self::Fork => JobType::ForkSandbox,
            Self::Clone => JobType::CloneSandbox,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Clone => "clone",
        }
    }
}

fn copy_request(source: &Sandbox, name: &str) -> NewSandbox {
    let mut request = NewSandbox::new(&source.organization_id, name, &source.region);
    request.class = source.class;
    request.snapshot = source.snapshot.clone();
    request.os_user = source.os_user.clone();
    request.env = source.env.clone();
    request.resources = source.resources.clone();
    request.network = source.network.clone();
    request.auto_stop_minutes = source.auto_stop_minutes;
    request.auto_archive_minutes = source.auto_archive_minutes;
    request.auto_delete_minutes = source.auto_delete_minutes;
    request.dedicated_only = source.dedicated_only;
    request
}

impl SandboxManager {
    /// Fork a sandbox: the copy records the source as its parent.
    pub async fn fork(&self, source_id: &str, name: &str) -> Result<Sandbox> {
        self.copy(source_id, name, CopyKind::Fork).await
    }

    /// Clone a sandbox's filesystem into an unrelated new sandbox that only
    /// remembers where it was copied from.
    pub async fn clone_sandbox(&self, source_id: &str, name: &str) -> Result<Sandbox> {
        self.copy(source_id, name, CopyKind::Clone).await
    }

    async fn copy(&self, source_id: &str, name: &str, kind: CopyKind) -> Result<Sandbox> {
        if name.trim().is_empty() {
            return Err(Error::message("sandbox name must not be empty"));
        }
        let guard = self.lock(source_id).await?;
        let result = self.copy_locked(source_id, name, kind).await;
        guard.release().await?;
        result
    }

    async fn copy_locked(&self, source_id: &str, name: &str, kind: CopyKind) -> Result<Sandbox> {
        let source = self.get(source_id).await?;
        if !matches!(source.state, SandboxState::Started | SandboxState::Stopped) {
            return Err(Error::invalid_state(source_id, source.state, kind.action()));
        }
        let runner = self.runner_of(&source).await?;
        self.allocator.reserve_on(&runner, &source.resources).await?;

        let mut copy = copy_request(&source, name).into_sandbox();
        copy.image = source.image.clone();
        copy.runner_id = Some(runner.id.clone());
        match kind {
            CopyKind::Fork => copy.parent_sandbox_id = Some(source.id.clone()),
            CopyKind::Clone => copy.source_sandbox_id = Some(source.id.clone()),
        }
        // Held until the copy job exists so a sweep cannot mistake the row
        // for an unstarted create.
        let guard = self.lock(&copy.id).await?;
        let result = self.enqueue_copy(&mut copy, &source, kind).await;
        guard.release().await?;
        if result.is_err() {
            self.allocator.release(&runner.id, &copy.resources).await?;
        }
        result.map(|()| copy)
    }

    async fn enqueue_copy(&self, copy: &mut Sandbox, source: &Sandbox, kind: CopyKind) -> Result<()> {
        self.store.insert(copy).await?;
        let mut job = Job::new(kind.job_type(), &copy.id)
            .with_payload(json!({ "sourceSandboxId": source.id }));
        if let Some(runner_id) = &copy.runner_id {
            job = job.on_runner(runner_id);
        }
        if let Err(e) = self.jobs.enqueue(&job).await {
            copy.runner_id = None;
            copy.set_state(SandboxState::Destroyed);
            self.save(copy).await?;
            return Err(e.into());
        }
        info!(
            sandbox_id = %copy.id,
            source_sandbox_id = %source.id,
            runner_id = ?copy.runner_id,
            job_id = %job.id,
            kind = kind.action(),
            "sandbox copy requested"
        );
        Ok(())
    }

    /// Capture the sandbox's filesystem as a named snapshot. It is
    /// registered with the snapshot pipeline once the runner has pushed it.
    pub async fn create_snapshot(&self, id: &str, name: &str) -> Result<Sandbox> {
        if name.trim().is_empty() {
            return Err(Error::message("snapshot name must not be empty"));
        }
        let guard = self.lock(id).await?;
        let result = async {
            let mut sandbox = self.get(id).await?;
            if !matches!(sandbox.state, SandboxState::Started | SandboxState::Stopped)
                || self.job_in_flight(id).await?
            {
                return Err(Error::invalid_state(id, sandbox.state, "snapshot"));
            }
            let state = sandbox.state;
            let job = self
                .job_for(&sandbox, JobType::CreateSandboxSnapshot, state)
                .with_payload(json!({ "name": name }));
            self.enqueue_job(&mut sandbox, job, state).await?;
            Ok(sandbox)
        }
        .await;
        guard.release().await?;
        result
    }
}
