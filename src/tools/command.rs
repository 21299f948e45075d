//! Process-backed tools for the daemon binary.
//!
//! Start spawns the configured program, stop kills it, pause/resume deliver
//! SIGSTOP/SIGCONT (Unix only) and probe reports whether the child is alive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::capability::ToolCapability;
use crate::types::{Error, Result, ToolId};

/// How to launch a tool process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Tool backed by a child process.
#[derive(Debug)]
pub struct CommandTool {
    tool: ToolId,
    spec: CommandSpec,
    child: Mutex<Option<Child>>,
}

impl CommandTool {
    pub fn new(tool: ToolId, spec: CommandSpec) -> Self {
        Self {
            tool,
            spec,
            child: Mutex::new(None),
        }
    }

    #[cfg(unix)]
    async fn signal(&self, signal: Signal) -> Result<()> {
        let guard = self.child.lock().await;
        let pid = guard
            .as_ref()
            .and_then(Child::id)
            .ok_or_else(|| Error::command_failed(format!("{} is not running", self.tool)))?;
        let pid = i32::try_from(pid)
            .map_err(|_| Error::internal(format!("pid {} out of range for {}", pid, self.tool)))?;

        kill(Pid::from_raw(pid), signal).map_err(|errno| {
            Error::command_failed(format!(
                "{} for {} failed: {}",
                signal.as_str(),
                self.tool,
                errno
            ))
        })
    }
}

#[async_trait]
impl ToolCapability for CommandTool {
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        tracing::debug!(
            "tool_process_spawned: tool={}, pid={:?}",
            self.tool,
            child.id()
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn pause(&self) -> Result<()> {
        self.signal(Signal::SIGSTOP).await
    }

    #[cfg(unix)]
    async fn resume(&self) -> Result<()> {
        self.signal(Signal::SIGCONT).await
    }

    #[cfg(not(unix))]
    async fn pause(&self) -> Result<()> {
        Err(Error::unsupported("SIGSTOP is not available on this platform"))
    }

    #[cfg(not(unix))]
    async fn resume(&self) -> Result<()> {
        Err(Error::unsupported("SIGCONT is not available on this platform"))
    }

    async fn probe(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            None => Err(Error::command_failed(format!("{} is not running", self.tool))),
            Some(child) => match child.try_wait()? {
                Some(status) => Err(Error::command_failed(format!(
                    "{} exited with {}",
                    self.tool, status
                ))),
                None => Ok(()),
            },
        }
    }
}
