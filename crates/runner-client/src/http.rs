//! JSON-over-HTTP adapter for the runner API.

use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::{Client, Method, RequestBuilder, Response},
    secrecy::ExposeSecret,
    serde::{Serialize, de::DeserializeOwned},
    tracing::debug,
    url::Url,
};

use {
    crate::{
        BackupRequest, BuildSnapshotRequest, CopySandboxRequest, CreateSandboxRequest, DiskRequest,
        Error, ForkDiskRequest, HealthReport, NetworkSettings, PullSnapshotRequest, Result,
        RunnerApi, RunnerTarget, SandboxSnapshotRequest, SnapshotInfo,
    },
    corral_common::Resources,
};

/// Talks to runners over HTTP(S) with bearer-token auth.
pub struct HttpRunnerApi {
    client: Client,
}

impl HttpRunnerApi {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    fn request(&self, runner: &RunnerTarget, method: Method, path: &str) -> Result<RequestBuilder> {
        let base = Url::parse(&runner.api_url)?;
        let url = base.join(path.trim_start_matches('/'))?;
        debug!(runner_id = %runner.id, %method, %url, "runner request");
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(runner.api_key.expose_secret())
            .header("Accept", "application/json"))
    }

    async fn send(req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        runner: &RunnerTarget,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let mut req = self.request(runner, method, path)?;
        if let Some(body) = body {
            req = req.json(body);
        }
        Self::send(req).await?;
        Ok(())
    }

    async fn fetch<T: DeserializeOwned>(&self, runner: &RunnerTarget, path: &str) -> Result<T> {
        let req = self.request(runner, Method::GET, path)?;
        Ok(Self::send(req).await?.json().await?)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        runner: &RunnerTarget,
        path: &str,
        body: &B,
    ) -> Result<()> {
        self.call(runner, Method::POST, path, Some(body)).await
    }

    async fn post_empty(&self, runner: &RunnerTarget, path: &str) -> Result<()> {
        self.call::<()>(runner, Method::POST, path, None).await
    }

    async fn delete(&self, runner: &RunnerTarget, path: &str) -> Result<()> {
        self.call::<()>(runner, Method::DELETE, path, None).await
    }
}

#[async_trait]
impl RunnerApi for HttpRunnerApi {
    async fn health(&self, runner: &RunnerTarget) -> Result<HealthReport> {
        self.fetch(runner, "info").await
    }

    async fn create_sandbox(
        &self,
        runner: &RunnerTarget,
        req: &CreateSandboxRequest,
    ) -> Result<()> {
        self.post(runner, "sandboxes", req).await
    }

    async fn start_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.post_empty(runner, &format!("sandboxes/{sandbox_id}/start"))
            .await
    }

    async fn stop_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.post_empty(runner, &format!("sandboxes/{sandbox_id}/stop"))
            .await
    }

    async fn destroy_sandbox(&self, runner: &RunnerTarget, sandbox_id: &str) -> Result<()> {
        self.delete(runner, &format!("sandboxes/{sandbox_id}")).await
    }

    async fn resize_sandbox(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        resources: &Resources,
    ) -> Result<()> {
        self.post(runner, &format!("sandboxes/{sandbox_id}/resize"), resources)
            .await
    }

    async fn create_backup(&self, runner: &RunnerTarget, req: &BackupRequest) -> Result<()> {
        self.post(runner, &format!("sandboxes/{}/backup", req.sandbox_id), req)
            .await
    }

    async fn update_network_settings(
        &self,
        runner: &RunnerTarget,
        sandbox_id: &str,
        settings: &NetworkSettings,
    ) -> Result<()> {
        self.post(
            runner,
            &format!("sandboxes/{sandbox_id}/network-settings"),
            settings,
        )
        .await
    }

    async fn create_sandbox_snapshot(
        &self,
        runner: &RunnerTarget,
        req: &SandboxSnapshotRequest,
    ) -> Result<()> {
        self.post(runner, &format!("sandboxes/{}/snapshot", req.sandbox_id), req)
            .await
    }

    async fn fork_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()> {
        self.post(runner, &format!("sandboxes/{}/fork", req.source_sandbox_id), req)
            .await
    }

    async fn clone_sandbox(&self, runner: &RunnerTarget, req: &CopySandboxRequest) -> Result<()> {
        self.post(runner, &format!("sandboxes/{}/clone", req.source_sandbox_id), req)
            .await
    }

    async fn build_snapshot(
        &self,
        runner: &RunnerTarget,
        req: &BuildSnapshotRequest,
    ) -> Result<()> {
        self.post(runner, "snapshots/build", req).await
    }

    async fn pull_snapshot(&self, runner: &RunnerTarget, req: &PullSnapshotRequest) -> Result<()> {
        self.post(runner, "snapshots/pull", req).await
    }

    async fn remove_snapshot(&self, runner: &RunnerTarget, snapshot_ref: &str) -> Result<()> {
        let req = self
            .request(runner, Method::POST, "snapshots/remove")?
            .query(&[("snapshot", snapshot_ref)]);
        Self::send(req).await?;
        Ok(())
    }

    async fn inspect_snapshot(
        &self,
        runner: &RunnerTarget,
        snapshot_ref: &str,
    ) -> Result<SnapshotInfo> {
        let req = self
            .request(runner, Method::GET, "snapshots/info")?
            .query(&[("snapshot", snapshot_ref)]);
        Ok(Self::send(req).await?.json().await?)
    }

    async fn pull_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()> {
        self.post(runner, &format!("disks/{}/pull", req.disk_id), req)
            .await
    }

    async fn push_disk(&self, runner: &RunnerTarget, req: &DiskRequest) -> Result<()> {
        self.post(runner, &format!("disks/{}/push", req.disk_id), req)
            .await
    }

    async fn fork_disk(&self, runner: &RunnerTarget, req: &ForkDiskRequest) -> Result<()> {
        self.post(runner, &format!("disks/{}/fork", req.base_disk_id), req)
            .await
    }

    async fn delete_disk(&self, runner: &RunnerTarget, disk_id: &str) -> Result<()> {
        self.delete(runner, &format!("disks/{disk_id}")).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn target(server: &mockito::Server) -> RunnerTarget {
        RunnerTarget::new("runner-1", format!("{}/", server.url()), "secret-key")
    }

    fn api() -> HttpRunnerApi {
        HttpRunnerApi::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn health_parses_report_and_sends_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .match_header("authorization", "Bearer secret-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "cpuUsage": 12.5,
                    "memoryUsage": 40.0,
                    "diskUsage": 5.0,
                    "allocatedCpu": 4,
                    "allocatedMemoryGib": 8,
                    "allocatedDiskGib": 20,
                    "version": "0.9.1"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let report = api().health(&target(&server)).await.unwrap();
        assert_eq!(report.allocated_cpu, 4);
        assert_eq!(report.version.as_deref(), Some("0.9.1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn start_posts_to_sandbox_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sandboxes/sb-1/start")
            .with_status(200)
            .create_async()
            .await;

        api()
            .start_sandbox(&target(&server), "sb-1")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_keeps_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/sandboxes/sb-1/stop")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let err = api()
            .stop_sandbox(&target(&server), "sb-1")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("status code 502"));
    }

    #[tokio::test]
    async fn structured_error_body_is_exposed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/sandboxes")
            .with_status(500)
            .with_body(r#"{"message":"No space left on device","recoverable":true}"#)
            .create_async()
            .await;

        let req = CreateSandboxRequest {
            sandbox_id: "sb-2".into(),
            snapshot: Some("ubuntu:24.04".into()),
            os_user: "corral".into(),
            resources: Resources::new(1, 1, 3),
            env: Default::default(),
            network: NetworkSettings::default(),
            auth_token: "tok".into(),
            restore_from: None,
            disks: Vec::new(),
        };
        let err = api()
            .create_sandbox(&target(&server), &req)
            .await
            .unwrap_err();
        let details = err.details().unwrap();
        assert_eq!(details["recoverable"], true);
    }

    #[tokio::test]
    async fn snapshot_ref_is_sent_as_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/snapshots/info")
            .match_query(mockito::Matcher::UrlEncoded(
                "snapshot".into(),
                "registry.local/team/app:1".into(),
            ))
            .with_status(200)
            .with_body(r#"{"sizeGib":1.5,"entrypoint":["/bin/sh"]}"#)
            .create_async()
            .await;

        let info = api()
            .inspect_snapshot(&target(&server), "registry.local/team/app:1")
            .await
            .unwrap();
        assert_eq!(info.entrypoint, vec!["/bin/sh".to_string()]);
        mock.assert_async().await;
    }
}
