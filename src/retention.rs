//! Retention sweeper (component H): a daemon task that periodically purges
//! expired task directories.
//!
//! Grounded on `core.py::_start_cleanup_timer`/`_periodic_cleanup`/
//! `stop_cleanup_timer`/`__del__` for the lifecycle, and on the teacher's
//! `SessionManager::start_reaper` for the Rust `tokio::spawn` +
//! `tokio::time::interval` daemon-task idiom.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::sandbox_env::SandboxEnv;

/// Runs `SandboxEnv::purge` on an hourly cadence until stopped.
pub struct RetentionSweeper {
    handle: Option<JoinHandle<()>>,
}

impl RetentionSweeper {
    /// Start the sweeper against `env`'s base directory, sweeping every
    /// `interval` (the original hardcodes one hour; this takes it as a
    /// parameter so tests can use a short interval).
    #[must_use]
    pub fn start(env: Arc<SandboxEnv>, base_dir: String, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                info!("Starting retention sweep");
                env.purge(&base_dir, None).await;
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    /// Stop the sweeper. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Retention sweeper stopped");
        }
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::instance_inspector::{CpuUtilization, InstanceInspector, InstanceStatus};
    use crate::remote_shell::ProcessRemoteShell;
    use async_trait::async_trait;

    struct StubInspector;

    #[async_trait]
    impl InstanceInspector for StubInspector {
        async fn status(&self) -> anyhow::Result<InstanceStatus> {
            Ok(InstanceStatus {
                instance_id: "i-stub".to_string(),
                state: "running".to_string(),
                instance_type: "t3.micro".to_string(),
                public_ip: None,
                private_ip: None,
                launch_time: String::new(),
                os_name: "Unknown".to_string(),
                cpu_utilization: CpuUtilization::NoData {
                    message: "stub".to_string(),
                    period_minutes: 5,
                },
            })
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let env = Arc::new(SandboxEnv::new(
            SandboxConfig {
                instance_id: "i-test".to_string(),
                region: "us-east-1".to_string(),
                aws_profile: Some("default".to_string()),
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                base_sandbox_dir: "/tmp/sandbox".to_string(),
                max_execution_time: 30,
                max_memory_mb: 512,
                cleanup_after_hours: 24,
                allowed_runtimes: vec!["bash".to_string()],
                notes: None,
            },
            Arc::new(ProcessRemoteShell::new()),
            Arc::new(StubInspector),
        ));

        let mut sweeper = RetentionSweeper::start(env, "/tmp/sandbox".to_string(), Duration::from_secs(3600));
        sweeper.stop();
        sweeper.stop();
    }
}
