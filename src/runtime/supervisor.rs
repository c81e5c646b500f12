use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::health::{HealthRegistry, HealthStatus};
use super::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::messaging::EventChannel;

// ============================================================================
// Supervisor - owns the long-running tasks of one process
// ============================================================================
//
// Responsibilities:
// - Spawns role tasks bound to one shutdown signal
// - Reports each task's health, and flags a task that exits on its own
// - Periodically logs system health
// - Coordinates graceful shutdown on Ctrl-C
//
// Task layout (role = all):
//   Supervisor
//   ├── processor   (Created subscription)
//   ├── sweeper     (timer loop)
//   ├── notifier    (Completed + Expired subscriptions)
//   └── health      (periodic check)
//
// ============================================================================

const HEALTH_CHANNEL_COMPONENT: &str = "event_channel";

pub struct Supervisor {
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    health: Arc<HealthRegistry>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(health: Arc<HealthRegistry>) -> Self {
        let (trigger, shutdown) = shutdown_channel();
        Self {
            trigger,
            shutdown,
            health,
            tasks: Vec::new(),
        }
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn a task that is expected to run until shutdown
    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let component = name.to_string();
        let health = self.health.clone();
        let shutdown = self.shutdown.clone();

        health.update(&component, HealthStatus::Healthy, Some("started".to_string()));

        let handle = tokio::spawn({
            let component = component.clone();
            async move {
                task.await;
                if shutdown.is_triggered() {
                    tracing::info!(task = %component, "Task stopped");
                } else {
                    tracing::error!(task = %component, "Task exited before shutdown");
                    health.update(
                        &component,
                        HealthStatus::Unhealthy("task exited".to_string()),
                        None,
                    );
                }
            }
        });

        tracing::info!(task = %component, "Spawned supervised task");
        self.tasks.push((component, handle));
    }

    /// Periodically fold the channel's own health into the registry and log
    /// the overall system status.
    pub fn spawn_health_monitor(&mut self, channel: Arc<dyn EventChannel>, interval: Duration) {
        let health = self.health.clone();
        let shutdown = self.shutdown.clone();

        self.spawn("health_monitor", async move {
            loop {
                health.update(HEALTH_CHANNEL_COMPONENT, channel.health(), None);

                let system = health.snapshot();
                match system.overall_status {
                    HealthStatus::Healthy => {
                        tracing::debug!("System health check: Healthy");
                    }
                    HealthStatus::Degraded(ref msg) => {
                        tracing::warn!("System health check: Degraded - {}", msg);
                    }
                    HealthStatus::Unhealthy(ref msg) => {
                        tracing::error!("System health check: Unhealthy - {}", msg);
                    }
                }

                if !shutdown.sleep(interval).await {
                    break;
                }
            }
        });
    }

    /// Block until Ctrl-C, then stop every task
    pub async fn run_until_ctrl_c(self, grace: Duration) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, initiating graceful shutdown"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        self.stop(grace).await;
    }

    /// Trigger shutdown and wait up to `grace` for the tasks to finish.
    /// Tasks still running after that are aborted.
    pub async fn stop(self, grace: Duration) {
        self.trigger.trigger();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::error!(task = %name, error = %e, "Task panicked");
                    }
                }
                tracing::info!("All tasks stopped");
            }
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "Grace period elapsed, aborting tasks");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_stop_signals_tasks() {
        let health = Arc::new(HealthRegistry::new());
        let mut supervisor = Supervisor::new(health.clone());
        let stopped = Arc::new(AtomicBool::new(false));

        let shutdown = supervisor.shutdown();
        let flag = stopped.clone();
        supervisor.spawn("worker", async move {
            shutdown.triggered().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(supervisor.task_count(), 1);

        supervisor.stop(Duration::from_secs(5)).await;

        assert!(stopped.load(Ordering::SeqCst));
        assert!(health.snapshot().overall_status.is_healthy());
    }

    #[tokio::test]
    async fn test_early_exit_marks_task_unhealthy() {
        let health = Arc::new(HealthRegistry::new());
        let mut supervisor = Supervisor::new(health.clone());

        supervisor.spawn("short_lived", async {});
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = health.snapshot();
        assert!(matches!(snapshot.overall_status, HealthStatus::Unhealthy(_)));
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_grace_period_aborts_stuck_tasks() {
        let health = Arc::new(HealthRegistry::new());
        let mut supervisor = Supervisor::new(health);

        supervisor.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop(Duration::from_millis(20)))
            .await
            .unwrap();
    }
}
