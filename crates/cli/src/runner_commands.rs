use {
    anyhow::Result,
    clap::Subcommand,
    corral_common::Resources,
    corral_registry::{HealthMode, Region, Runner, RunnerClass, RunnerRegistration},
    secrecy::Secret,
};

use crate::server::ControlPlane;

#[derive(Subcommand)]
pub enum RegionAction {
    /// List regions.
    List,
    /// Create or update a region.
    Add {
        id: String,
        #[arg(long)]
        proxy_url: Option<String>,
        #[arg(long)]
        snapshot_manager_url: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RunnerAction {
    /// List runners with their capacity and score.
    List,
    /// Register a runner in an existing region.
    Register {
        id: String,
        #[arg(long)]
        region: String,
        #[arg(long, default_value = "linux")]
        class: RunnerClass,
        #[arg(long)]
        cpu: u32,
        #[arg(long)]
        memory_gib: u32,
        #[arg(long)]
        disk_gib: u32,
        #[arg(long)]
        api_url: String,
        #[arg(long, env = "CORRAL_RUNNER_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Dedicate the runner to one organization.
        #[arg(long)]
        organization: Option<String>,
        /// The runner pushes heartbeats instead of being polled.
        #[arg(long)]
        heartbeat: bool,
    },
    /// Stop placing new sandboxes on a runner.
    Drain { id: String },
    /// Accept placements on a drained runner again.
    Undrain { id: String },
    /// Delete a drained runner that no longer hosts sandboxes.
    Remove { id: String },
}

pub async fn handle_region(action: RegionAction, plane: &ControlPlane) -> Result<()> {
    match action {
        RegionAction::List => {
            for region in plane.registry.list_regions().await? {
                println!("{}", region.id);
            }
        },
        RegionAction::Add {
            id,
            proxy_url,
            snapshot_manager_url,
        } => {
            let region = plane
                .runners()
                .upsert_region(Region {
                    id,
                    proxy_url,
                    snapshot_manager_url,
                    ..Region::default()
                })
                .await?;
            println!("Region '{}' saved.", region.id);
        },
    }
    Ok(())
}

pub async fn handle_runner(action: RunnerAction, plane: &ControlPlane) -> Result<()> {
    let runners = plane.runners();
    match action {
        RunnerAction::List => {
            let list = runners.list().await?;
            if list.is_empty() {
                println!("No runners registered.");
            }
            for runner in &list {
                println!("{}", describe(runner));
            }
        },
        RunnerAction::Register {
            id,
            region,
            class,
            cpu,
            memory_gib,
            disk_gib,
            api_url,
            api_key,
            organization,
            heartbeat,
        } => {
            let runner = runners
                .register(RunnerRegistration {
                    id,
                    region,
                    class,
                    capacity: Resources::new(cpu, memory_gib, disk_gib),
                    api_url,
                    api_key: Secret::new(api_key),
                    organization_id: organization,
                    health_mode: if heartbeat {
                        HealthMode::Heartbeat
                    } else {
                        HealthMode::Poll
                    },
                })
                .await?;
            println!("Registered {}", describe(&runner));
        },
        RunnerAction::Drain { id } => {
            let runner = runners.drain(&id).await?;
            println!("Draining {}", describe(&runner));
        },
        RunnerAction::Undrain { id } => {
            let runner = runners.undrain(&id).await?;
            println!("Accepting placements: {}", describe(&runner));
        },
        RunnerAction::Remove { id } => {
            plane.manager.remove_runner(&id).await?;
            println!("Runner '{id}' removed.");
        },
    }
    Ok(())
}

fn describe(runner: &Runner) -> String {
    format!(
        "{}  region={} class={} state={:?}{} score={} allocated=[{}] capacity=[{}]",
        runner.id,
        runner.region,
        runner.class,
        runner.state,
        if runner.draining { " (draining)" } else { "" },
        runner.availability_score,
        runner.allocated,
        runner.capacity,
    )
}
