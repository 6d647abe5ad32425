//! Worker supervision.
//!
//! The supervisor registers one named pipe per worker, then re-executes the
//! current binary once per worker with its index and the pipe list in the
//! environment. Each worker runs in its own process group so shutdown reaches
//! anything it spawned.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::{Config, MessagingType, CONFIG_ENV_VAR, WORKER_INDEX_ENV_VAR};

#[cfg(unix)]
use crate::bus::{IpcBroker, WorkerIdentity, SUBSCRIBERS_ENV_VAR};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long a worker gets to exit after SIGTERM.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Managed child process with proper cleanup.
pub struct ManagedChild {
    child: Child,
    name: String,
}

impl ManagedChild {
    /// Spawn `program` with `args` and `env` in a new process group.
    pub async fn spawn(
        name: &str,
        program: &std::path::Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, BoxError> {
        info!(name = %name, program = %program.display(), "Spawning worker");

        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            error!(name = %name, error = %e, "Failed to spawn worker");
            e
        })?;

        info!(name = %name, pid = ?child.id(), "Worker started");

        Ok(Self {
            child,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Kill the process and all its descendants.
    pub async fn kill(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        info!(name = %self.name, pid, "Stopping worker");

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(name = %self.name, error = %e, "Failed to send SIGTERM to process group");
            }
        }

        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(name = %self.name, status = ?status, "Worker exited");
            }
            Ok(Err(e)) => {
                warn!(name = %self.name, error = %e, "Error waiting for worker");
            }
            Err(_) => {
                warn!(name = %self.name, "Worker didn't exit gracefully, sending SIGKILL");

                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;

                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }

                let _ = self.child.kill().await;
            }
        }
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            #[cfg(unix)]
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            let _ = self.child.start_kill();
        }
    }
}

/// Environment for worker `index`.
pub fn worker_env(
    index: usize,
    config_path: Option<&str>,
    subscribers_json: Option<&str>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(WORKER_INDEX_ENV_VAR.to_string(), index.to_string());

    if let Some(path) = config_path {
        env.insert(CONFIG_ENV_VAR.to_string(), path.to_string());
    }

    #[cfg(unix)]
    if let Some(json) = subscribers_json {
        env.insert(SUBSCRIBERS_ENV_VAR.to_string(), json.to_string());
    }
    #[cfg(not(unix))]
    let _ = subscribers_json;

    env
}

/// Spawn `config.cluster.workers` workers and supervise them until Ctrl-C.
///
/// A worker exiting on its own brings the whole group down.
pub async fn supervise(config: &Config, config_path: Option<&str>) -> Result<(), BoxError> {
    let workers = config.cluster.workers;
    let program = std::env::current_exe()?;

    #[cfg(unix)]
    let broker = match config.messaging.messaging_type {
        MessagingType::Ipc => {
            let mut broker = IpcBroker::new(&config.messaging.ipc.base_path)?;
            for index in 0..workers {
                broker.register_worker(&WorkerIdentity::new(index).name())?;
            }
            Some(broker)
        }
        MessagingType::Channel => None,
    };
    #[cfg(unix)]
    let subscribers_json = broker.as_ref().map(|b| b.workers_to_json());

    #[cfg(not(unix))]
    let subscribers_json: Option<String> = match config.messaging.messaging_type {
        MessagingType::Ipc => return Err("IPC messaging is only available on unix".into()),
        MessagingType::Channel => None,
    };

    let mut children: Vec<ManagedChild> = Vec::with_capacity(workers);
    for index in 0..workers {
        let env = worker_env(index, config_path, subscribers_json.as_deref());
        let child =
            ManagedChild::spawn(&format!("worker-{index}"), &program, &[], &env).await?;
        children.push(child);
    }

    info!(workers, "All workers started");
    info!("Press Ctrl+C to exit");

    let exited = {
        let waits = children.iter_mut().map(|c| Box::pin(c.wait()));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            (status, index, _) = futures::future::select_all(waits) => Some((index, status)),
        }
    };

    if let Some((index, status)) = exited {
        error!(worker = index, status = ?status, "Worker exited, stopping cluster");
    }

    info!("Shutting down {} workers...", children.len());
    for child in children.iter_mut().rev() {
        child.kill().await;
    }

    info!("All workers terminated");
    Ok(())
}
