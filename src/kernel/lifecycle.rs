//! Command dispatch and completion delivery.
//!
//! The control loop never awaits a tool. Each issued command runs in its own
//! task, bounded by the in-flight semaphore and the command deadline, and
//! reports back through the signal channel tagged with the generation it was
//! issued under. The scheduler drops completions whose generation is stale.
//!
//! Calls on one tool never overlap: a command that replaces an in-flight one
//! aborts it and waits for its task to end before touching the capability.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;

use super::recovery::with_recovery;
use super::types::LifecycleCommand;
use crate::tools::capability::SharedCapability;
use crate::types::{Error, Result, ToolId};

/// Result of a lifecycle command.
#[derive(Debug)]
pub struct Completion {
    pub tool: ToolId,
    pub generation: u64,
    pub command: LifecycleCommand,
    pub result: Result<()>,
}

/// Result of a liveness probe.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub tool: ToolId,
    pub generation: u64,
    pub result: Result<()>,
}

/// Messages from tool tasks back to the scheduler.
#[derive(Debug)]
pub enum Signal {
    Completion(Completion),
    Probe(ProbeOutcome),
}

/// Work done before a command's own capability call.
#[derive(Debug, Default)]
pub enum Prelude {
    #[default]
    Direct,
    /// Abort this in-flight task and wait for it to end. Its completion is
    /// never delivered.
    Supersede(JoinHandle<()>),
    /// Restart of a Failed tool: best-effort `stop()` of whatever is left
    /// before `start()`.
    Recycle,
}

/// Spawns capability calls and routes their results.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    deadline: Duration,
    signals: mpsc::UnboundedSender<Signal>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        max_in_flight: usize,
        deadline: Duration,
        signals: mpsc::UnboundedSender<Signal>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            deadline,
            signals,
            wake,
        }
    }

    /// Free command permits.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `command` in the background. The completion is always delivered,
    /// including for panics and timeouts, unless a later dispatch supersedes
    /// the returned task.
    pub fn dispatch(
        &self,
        tool: ToolId,
        generation: u64,
        command: LifecycleCommand,
        capability: SharedCapability,
        prelude: Prelude,
    ) -> JoinHandle<()> {
        if let Prelude::Supersede(previous) = &prelude {
            previous.abort();
        }
        let this = self.clone();
        tokio::spawn(async move {
            let recycle = match prelude {
                Prelude::Supersede(previous) => {
                    let _ = previous.await;
                    tracing::debug!("command_superseded: tool={}, by={}", tool, command);
                    false
                }
                Prelude::Recycle => true,
                Prelude::Direct => false,
            };
            let result = this.execute(&tool, command, capability, recycle).await;
            this.deliver(Signal::Completion(Completion {
                tool,
                generation,
                command,
                result,
            }));
        })
    }

    async fn execute(
        &self,
        tool: &ToolId,
        command: LifecycleCommand,
        capability: SharedCapability,
        recycle: bool,
    ) -> Result<()> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("command permits closed"))?;

        if recycle {
            let stop = with_recovery(capability.stop(), tool, "stop");
            match tokio::time::timeout(self.deadline, stop).await {
                Ok(Ok(())) => tracing::debug!("tool_recycled: tool={}", tool),
                Ok(Err(error)) => {
                    tracing::warn!("recycle_stop_failed: tool={}, error={}", tool, error)
                }
                Err(_) => tracing::warn!("recycle_stop_timed_out: tool={}", tool),
            }
        }

        let call = async move {
            match command {
                LifecycleCommand::Start => capability.start().await,
                LifecycleCommand::Stop => capability.stop().await,
                LifecycleCommand::Pause => capability.pause().await,
                LifecycleCommand::Resume => capability.resume().await,
            }
        };

        let guarded = with_recovery(call, tool, command.as_str());
        match tokio::time::timeout(self.deadline, guarded).await {
            Ok(result) => result,
            Err(_) => Err(Error::CommandTimeout {
                tool: tool.clone(),
                command: command.to_string(),
                elapsed_ms: u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Probe liveness in the background. Probes do not take command permits.
    pub fn probe(&self, tool: ToolId, generation: u64, capability: SharedCapability) {
        let this = self.clone();
        tokio::spawn(async move {
            let probe = async move { capability.probe().await };
            let guarded = with_recovery(probe, &tool, "probe");
            let result = match tokio::time::timeout(this.deadline, guarded).await {
                Ok(result) => result,
                Err(_) => Err(Error::CommandTimeout {
                    tool: tool.clone(),
                    command: "probe".to_string(),
                    elapsed_ms: u64::try_from(this.deadline.as_millis()).unwrap_or(u64::MAX),
                }),
            };
            this.deliver(Signal::Probe(ProbeOutcome {
                tool,
                generation,
                result,
            }));
        });
    }

    fn deliver(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!("signal_dropped: scheduler gone");
        }
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::capability::MockToolCapability;

    fn dispatcher(limit: usize, deadline: Duration) -> (Dispatcher, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(limit, deadline, tx, Arc::new(Notify::new())), rx)
    }

    async fn next_completion(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Completion {
        match rx.recv().await {
            Some(Signal::Completion(c)) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_calls_matching_operation() {
        let mut mock = MockToolCapability::new();
        mock.expect_pause().times(1).returning(|| Ok(()));
        mock.expect_start().never();
        let (d, mut rx) = dispatcher(2, Duration::from_secs(1));

        d.dispatch(
            ToolId::must("sim"),
            7,
            LifecycleCommand::Pause,
            Arc::new(mock),
            Prelude::Direct,
        );
        let c = next_completion(&mut rx).await;
        assert_eq!(c.generation, 7);
        assert_eq!(c.command, LifecycleCommand::Pause);
        assert!(c.result.is_ok());
    }

    #[tokio::test]
    async fn test_failure_is_delivered() {
        let mut mock = MockToolCapability::new();
        mock.expect_start()
            .returning(|| Err(Error::command_failed("exit 1")));
        let (d, mut rx) = dispatcher(1, Duration::from_secs(1));

        d.dispatch(
            ToolId::must("sim"),
            1,
            LifecycleCommand::Start,
            Arc::new(mock),
            Prelude::Direct,
        );
        let c = next_completion(&mut rx).await;
        assert!(matches!(c.result, Err(Error::CommandFailed(_))));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let mut mock = MockToolCapability::new();
        mock.expect_stop().returning(|| panic!("tool blew up"));
        let (d, mut rx) = dispatcher(1, Duration::from_secs(1));

        d.dispatch(
            ToolId::must("sim"),
            3,
            LifecycleCommand::Stop,
            Arc::new(mock),
            Prelude::Direct,
        );
        let c = next_completion(&mut rx).await;
        assert!(matches!(c.result, Err(Error::Internal(_))));
        // Permit was released.
        assert_eq!(d.available_permits(), 1);
    }

    #[derive(Debug)]
    struct Hanging;

    #[async_trait::async_trait]
    impl crate::tools::capability::ToolCapability for Hanging {
        async fn start(&self) -> Result<()> {
            futures::future::pending().await
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
        async fn probe(&self) -> Result<()> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_overrun_is_timeout() {
        let (d, mut rx) = dispatcher(1, Duration::from_secs(30));
        d.dispatch(
            ToolId::must("slow"),
            1,
            LifecycleCommand::Start,
            Arc::new(Hanging),
            Prelude::Direct,
        );
        let c = next_completion(&mut rx).await;
        match c.result {
            Err(Error::CommandTimeout { elapsed_ms, ref command, .. }) => {
                assert_eq!(elapsed_ms, 30_000);
                assert_eq!(command, "start");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bound_serialises_commands() {
        let (d, mut rx) = dispatcher(1, Duration::from_secs(30));
        d.dispatch(
            ToolId::must("slow"),
            1,
            LifecycleCommand::Start,
            Arc::new(Hanging),
            Prelude::Direct,
        );
        d.dispatch(
            ToolId::must("quick"),
            1,
            LifecycleCommand::Stop,
            Arc::new(Hanging),
            Prelude::Direct,
        );

        // The quick stop waits behind the hanging start.
        let first = next_completion(&mut rx).await;
        assert_eq!(first.tool.as_str(), "slow");
        let second = next_completion(&mut rx).await;
        assert_eq!(second.tool.as_str(), "quick");
        assert!(second.result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_through_signal() {
        let (d, mut rx) = dispatcher(1, Duration::from_secs(5));
        d.probe(ToolId::must("slow"), 4, Arc::new(Hanging));
        match rx.recv().await {
            Some(Signal::Probe(p)) => {
                assert_eq!(p.generation, 4);
                assert!(p.result.is_err());
            }
            other => panic!("expected probe, got {other:?}"),
        }
    }

    /// Start takes ten seconds before the tool is up.
    #[derive(Debug, Default)]
    struct SlowStart {
        up: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::tools::capability::ToolCapability for SlowStart {
        async fn start(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.up.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.up.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_start_never_brings_tool_up() {
        let tool = Arc::new(SlowStart::default());
        let (d, mut rx) = dispatcher(2, Duration::from_secs(30));
        let start = d.dispatch(
            ToolId::must("slow"),
            1,
            LifecycleCommand::Start,
            tool.clone(),
            Prelude::Direct,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;

        d.dispatch(
            ToolId::must("slow"),
            2,
            LifecycleCommand::Stop,
            tool.clone(),
            Prelude::Supersede(start),
        );
        let c = next_completion(&mut rx).await;
        assert_eq!(c.command, LifecycleCommand::Stop);
        assert_eq!(c.generation, 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!tool.up.load(std::sync::atomic::Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
        assert_eq!(d.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_recycle_stops_before_starting() {
        let mut seq = mockall::Sequence::new();
        let mut mock = MockToolCapability::new();
        mock.expect_stop()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::command_failed("no such process")));
        mock.expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let (d, mut rx) = dispatcher(1, Duration::from_secs(1));

        d.dispatch(
            ToolId::must("sim"),
            5,
            LifecycleCommand::Start,
            Arc::new(mock),
            Prelude::Recycle,
        );
        let c = next_completion(&mut rx).await;
        assert_eq!(c.command, LifecycleCommand::Start);
        assert!(c.result.is_ok());
    }
}
