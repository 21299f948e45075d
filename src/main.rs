//! Warden daemon - main entry point.
//!
//! Loads the configuration, samples the host with sysinfo, runs the scheduler
//! loop and logs every scheduler event until Ctrl-C.

use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use warden_core::kernel::sampler::{SamplerHandle, SysinfoSampler};
use warden_core::kernel::service::{SchedulerHandle, SchedulerService};
use warden_core::tools::{CommandTool, DetachedTool, SharedCapability};
use warden_core::{Config, Scheduler, SchedulerEvent};

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Resource-aware tool lifecycle scheduler")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    warden_core::observability::init_tracing(&config.observability);

    let cancel = CancellationToken::new();
    let sampler = SamplerHandle::new(Arc::new(SysinfoSampler::new()), config.sampler.interval);
    sampler.refresh().await;
    let sampler_task = sampler.spawn(cancel.clone());

    let (scheduler, report) = Scheduler::from_config(&config, sampler, |tool| {
        let capability: SharedCapability = match &tool.command {
            Some(spec) => Arc::new(CommandTool::new(tool.descriptor.id.clone(), spec.clone())),
            None => Arc::new(DetachedTool),
        };
        capability
    });
    for failure in &report.rejected_tools {
        tracing::warn!("startup_tool_rejected: tool={}, error={}", failure.tool, failure.error);
    }
    for (name, error) in &report.rejected_profiles {
        tracing::warn!("startup_profile_rejected: profile={}, error={}", name, error);
    }

    let handle = SchedulerHandle::new(scheduler);
    let mut events = Box::pin(handle.events());
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event {
                SchedulerEvent::StateChanged(change) => tracing::info!(
                    "event_state_changed: tool={}, from={}, to={}, reason={}",
                    change.tool,
                    change.old_state,
                    change.new_state,
                    change.reason
                ),
                SchedulerEvent::ResourceAlert(alert) => tracing::error!(
                    "event_resource_alert: reason={:?}, level={}",
                    alert.reason,
                    alert.level
                ),
                other => tracing::info!("event: {:?}", other),
            }
        }
    });

    let mut service = SchedulerService::new(handle);
    let service_task = service.start().await;
    tracing::info!("warden_started: tools={}", config.tools.len().saturating_sub(report.rejected_tools.len()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("warden_shutting_down");

    service.stop();
    cancel.cancel();
    let _ = service_task.await;
    let _ = sampler_task.await;
    event_task.abort();
    Ok(())
}
