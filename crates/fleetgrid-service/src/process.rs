//! Service processes: spawn, terminate, sample.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetgrid_state::ServiceConfiguration;

use crate::error::{ServiceError, ServiceResult};

/// Exit code reported when the real one cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// A running service process.
pub struct ServiceProcess {
    name: String,
    child: Child,
    pid: u32,
    output: Vec<JoinHandle<()>>,
}

impl ServiceProcess {
    /// Spawn the configured command inside `directory`.
    ///
    /// The process inherits the configured environment plus
    /// `FLEETGRID_SERVICE_NAME`, `FLEETGRID_SERVICE_ID` and
    /// `FLEETGRID_SERVICE_PORT`. Its output is forwarded to tracing.
    pub fn spawn(config: &ServiceConfiguration, directory: &Path) -> ServiceResult<Self> {
        let name = config.service_id.name.clone();
        let (program, args) = config
            .process
            .command
            .split_first()
            .ok_or_else(|| ServiceError::EmptyCommand(name.clone()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(directory)
            .envs(&config.process.environment)
            .env("FLEETGRID_SERVICE_NAME", &name)
            .env("FLEETGRID_SERVICE_ID", config.service_id.unique_id.to_string())
            .env("FLEETGRID_SERVICE_PORT", config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ServiceError::Spawn {
            name: name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let mut output = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            output.push(tokio::spawn(forward_lines(name.clone(), "stdout", stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            output.push(tokio::spawn(forward_lines(name.clone(), "stderr", stderr)));
        }

        info!(service = %name, pid, %program, "process spawned");
        Ok(Self {
            name,
            child,
            pid,
            output,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code if the process has already exited.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            Ok(None) => None,
            Err(e) => {
                warn!(service = %self.name, error = %e, "failed to poll process status");
                None
            }
        }
    }

    /// Stop the process and return its exit code.
    ///
    /// Without `force`, SIGTERM is sent first and the process is given
    /// `timeout` to exit before it is killed.
    pub async fn terminate(mut self, force: bool, timeout: Duration) -> i32 {
        if let Some(code) = self.try_exit_code() {
            self.abort_output();
            return code;
        }

        if !force {
            #[cfg(unix)]
            {
                debug!(service = %self.name, pid = self.pid, "sending SIGTERM");
                // SAFETY: plain signal delivery to a child we own.
                unsafe {
                    libc::kill(self.pid as i32, libc::SIGTERM);
                }

                match tokio::time::timeout(timeout, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        self.abort_output();
                        return exit_code(status);
                    }
                    Ok(Err(e)) => {
                        warn!(service = %self.name, error = %e, "error waiting for process");
                    }
                    Err(_) => {
                        warn!(service = %self.name, ?timeout, "process did not stop gracefully, killing");
                    }
                }
            }
            #[cfg(not(unix))]
            let _ = timeout;
        }

        if let Err(e) = self.child.start_kill() {
            debug!(service = %self.name, error = %e, "kill failed");
        }
        let code = match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(service = %self.name, error = %e, "error reaping process");
                UNKNOWN_EXIT_CODE
            }
        };
        self.abort_output();
        code
    }

    fn abort_output(&mut self) {
        for task in self.output.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        self.abort_output();
    }
}

/// Map an exit status to a shell-style code (`128 + signal` when killed).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

async fn forward_lines<R: AsyncRead + Unpin>(service: String, stream: &'static str, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "fleetgrid::service_output", %service, stream, "{line}");
    }
}

/// Per-process CPU and memory sampling.
pub struct ProcessSampler {
    system: Mutex<System>,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// `(cpu_percent, memory_bytes)` of `pid`, or `None` if it is gone.
    /// CPU reads 0 until the process has been sampled twice.
    pub fn sample(&self, pid: u32) -> Option<(f32, u64)> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let process = system.process(pid)?;
        Some((process.cpu_usage(), process.memory()))
    }
}
