use super::{
    CalculatorDescriptor, CalculatorSettings, ExecutionRequest, Failure, Outcome, Success,
};
use crate::config::ConfigErrors;
use std::{
    fs::File,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// captured standard output of a calculation
pub const STDOUT_FILE: &str = "out.txt";
/// captured standard error of a calculation
pub const STDERR_FILE: &str = "err.txt";

/// Calculator that runs a shell command in the case directory on this machine
#[derive(Debug)]
pub struct LocalCalculator {
    pub(super) descriptor: CalculatorDescriptor,
    command: String,
    shell: PathBuf,
}

impl LocalCalculator {
    pub fn load(
        descriptor: CalculatorDescriptor,
        command: String,
        settings: &CalculatorSettings,
    ) -> Result<Self, ConfigErrors> {
        let shell = settings
            .resolver
            .resolve("sh")
            .ok_or(ConfigErrors::MissingTool("sh"))?;

        Ok(Self {
            descriptor,
            command,
            shell,
        })
    }

    #[instrument(skip_all, fields(case = request.case.index, calculator = %self.descriptor), level = "debug")]
    pub fn execute(&self, request: &ExecutionRequest) -> Outcome {
        match run_shell(&self.shell, &self.command, request.dir, request.timeout) {
            Ok(status) if status.success() => Outcome::Success(Success {
                artifacts_dir: request.dir.to_path_buf(),
                exit_status: status.code(),
                outputs: None,
            }),
            Ok(status) => Outcome::Failure(Failure::Execution {
                status: status.code(),
                message: format!("'{}' exited unsuccessfully", self.command),
            }),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}

/// Run `command` with `shell -c` inside `dir`, see [`run_captured`]
pub fn run_shell(
    shell: &Path,
    command: &str,
    dir: &Path,
    timeout: Option<Duration>,
) -> Result<ExitStatus, Failure> {
    let mut process = Command::new(shell);
    process.arg("-c").arg(command);

    run_captured(process, dir, timeout)
}

/// Run `process` inside `dir`, capturing both streams into files of `dir`.
/// A child running longer than `timeout` is killed and reported as an execution failure.
pub fn run_captured(
    mut process: Command,
    dir: &Path,
    timeout: Option<Duration>,
) -> Result<ExitStatus, Failure> {
    let transport =
        |what: &str, error: std::io::Error| Failure::Transport(format!("{what}: {error}"));

    let stdout = File::create(dir.join(STDOUT_FILE))
        .map_err(|error| transport("failed to create stdout file", error))?;
    let stderr = File::create(dir.join(STDERR_FILE))
        .map_err(|error| transport("failed to create stderr file", error))?;

    let start = Instant::now();
    let mut child = process
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|error| transport("failed to spawn process", error))?;

    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(pid = child.id(), "Calculation ran into timeout, killing it");
                if let Err(error) = child.kill() {
                    warn!(error = ?error, "Failed to kill timed out calculation");
                }
                let _ = child.wait();

                return Err(Failure::Execution {
                    status: None,
                    message: format!("timeout after {} s", timeout.as_secs_f64()),
                });
            }
            Err(error) => return Err(transport("failed to wait for calculation", error)),
        },
        None => child
            .wait()
            .map_err(|error| transport("failed to wait for calculation", error))?,
    };

    debug!(
        "Finished in {} ms | status: {}",
        start.elapsed().as_millis(),
        status
    );

    Ok(status)
}
