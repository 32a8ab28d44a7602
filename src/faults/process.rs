//! Stress-process appliers for cpu, memory and disk-io faults
//!
//! The effect runs in a separate OS process, leader of its own process
//! group. Its own `--timeout` is only a backstop: revert always kills the
//! whole group, so helpers forked by a custom `command` go with it.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{FaultApplier, FaultHandle};
use crate::catalog::FaultDefinition;
use crate::{Error, Result};

/// How long to wait for a killed stress process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which resource the stress process saturates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressKind {
    /// CPU workers
    Cpu,
    /// Resident memory
    Memory,
    /// Disk writes
    DiskIo,
}

/// Spawns a stress process per applied fault
pub struct ProcessApplier {
    kind: StressKind,
    program: String,
}

impl ProcessApplier {
    /// Create an applier that runs `program` (normally `stress-ng`)
    #[must_use]
    pub fn new(kind: StressKind, program: &str) -> Self {
        Self {
            kind,
            program: program.to_string(),
        }
    }

    /// Build the argv for a fault.
    ///
    /// A `command` parameter replaces the generated command line entirely;
    /// `{duration}` inside it is substituted with the fault duration in seconds.
    pub fn command_line(&self, fault: &FaultDefinition) -> Result<Vec<String>> {
        let duration = fault.duration_seconds;

        if let Some(custom) = fault.param_str("command") {
            let expanded = custom.replace("{duration}", &duration.to_string());
            let argv = shlex::split(&expanded)
                .filter(|argv| !argv.is_empty())
                .ok_or_else(|| {
                    Error::applier(&fault.name, format!("unparsable command: {custom}"))
                })?;
            return Ok(argv);
        }

        let mut argv = vec![self.program.clone()];
        match self.kind {
            StressKind::Cpu => {
                argv.extend([
                    "--cpu".to_string(),
                    fault.param_u64("workers", 1).to_string(),
                    "--cpu-load".to_string(),
                    fault.param_u64("cpu_percent", 80).min(100).to_string(),
                ]);
            }
            StressKind::Memory => {
                argv.extend([
                    "--vm".to_string(),
                    "1".to_string(),
                    "--vm-bytes".to_string(),
                    format!("{}M", fault.param_u64("memory_mb", 100)),
                    "--vm-keep".to_string(),
                ]);
            }
            StressKind::DiskIo => {
                argv.extend([
                    "--hdd".to_string(),
                    fault.param_u64("workers", 1).to_string(),
                    "--hdd-bytes".to_string(),
                    format!("{}M", fault.param_u64("io_mb", 50)),
                ]);
                if let Some(path) = fault.param_str("temp_path") {
                    argv.extend(["--temp-path".to_string(), path.to_string()]);
                }
            }
        }
        argv.extend(["--timeout".to_string(), format!("{duration}s")]);
        Ok(argv)
    }
}

#[async_trait]
impl FaultApplier for ProcessApplier {
    async fn apply(&self, fault: &FaultDefinition) -> Result<FaultHandle> {
        let argv = self.command_line(fault)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::applier(&fault.name, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::applier(&fault.name, format!("failed to spawn {program}: {e}")))?;

        if let Some(status) = child.try_wait()? {
            return Err(Error::applier(
                &fault.name,
                format!("{program} exited immediately with {status}"),
            ));
        }

        let pid = child.id();
        info!(fault = %fault.name, pid = ?pid, kind = ?self.kind, "Stress process started");

        Ok(FaultHandle::Process(ProcessHandle {
            child: Mutex::new(Some(child)),
            pid,
            program: program.clone(),
        }))
    }

    async fn revert(&self, fault: &FaultDefinition, handle: &FaultHandle) -> Result<()> {
        match handle {
            FaultHandle::Process(process) => process.terminate(&fault.name).await,
            other => Err(Error::applier(
                &fault.name,
                format!("process applier cannot revert {}", other.describe()),
            )),
        }
    }
}

/// A tracked stress process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    program: String,
}

impl ProcessHandle {
    /// OS process id, if it was known at spawn time
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `program (pid)` for logs
    #[must_use]
    pub fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("{} ({pid})", self.program),
            None => self.program.clone(),
        }
    }

    /// Kill the process and reap it. A second call is a no-op.
    pub async fn terminate(&self, fault: &str) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            debug!(fault = %fault, "Stress process already terminated");
            return Ok(());
        };

        // The unreaped leader keeps its pid, so the group id cannot be reused yet.
        #[cfg(unix)]
        let group_killed = match self.pid {
            Some(pid) => kill_group(pid, fault).await,
            None => false,
        };
        #[cfg(not(unix))]
        let group_killed = false;

        if let Some(status) = child.try_wait()? {
            debug!(fault = %fault, %status, "Stress process had already exited");
            return Ok(());
        }

        if let Err(e) = child.start_kill() {
            if !group_killed {
                return Err(Error::applier(
                    fault,
                    format!("failed to kill {}: {e}", self.describe()),
                ));
            }
        }

        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!(fault = %fault, pid = ?self.pid, %status, "Stress process terminated");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::applier(fault, format!("failed to reap process: {e}"))),
            Err(_) => {
                warn!(fault = %fault, pid = ?self.pid, "Stress process did not exit after kill");
                Err(Error::applier(
                    fault,
                    format!("{} still running after kill", self.describe()),
                ))
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`
#[cfg(unix)]
async fn kill_group(pid: u32, fault: &str) -> bool {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            debug!(fault = %fault, pgid = pid, %status, "Process group kill refused");
            false
        }
        Err(e) => {
            warn!(fault = %fault, pgid = pid, error = %e, "Could not run kill for process group");
            false
        }
    }
}
