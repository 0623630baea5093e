use super::{
    local::run_captured, CalculatorDescriptor, CalculatorSettings, ExecutionRequest, Failure,
    Outcome, Success,
};
use crate::config::ConfigErrors;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, instrument, warn};

/// exit status ssh uses for its own (connection) errors
const SSH_ERROR_STATUS: i32 = 255;

/// Maps a local working directory to the directory the remote command runs in
pub trait Staging: Debug + Send + Sync {
    fn remote_dir(&self, local: &Path) -> String;

    /// make the rendered inputs available remotely
    fn stage_in(&self, session: &SshSession, local: &Path) -> Result<(), Failure>;

    /// bring the remote artifacts back into `local`
    fn stage_out(&self, session: &SshSession, local: &Path) -> Result<(), Failure>;
}

/// Local and remote host share the file system under identical paths
#[derive(Debug, Clone, Default)]
pub struct SharedFilesystem;

impl Staging for SharedFilesystem {
    fn remote_dir(&self, local: &Path) -> String {
        local
            .canonicalize()
            .unwrap_or_else(|_| local.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }

    fn stage_in(&self, _session: &SshSession, _local: &Path) -> Result<(), Failure> {
        Ok(())
    }

    fn stage_out(&self, _session: &SshSession, _local: &Path) -> Result<(), Failure> {
        Ok(())
    }
}

/// Copy the working directory below `remote_root` with scp and back again afterwards
#[derive(Debug, Clone)]
pub struct CopyStaging {
    pub remote_root: String,
}

impl Staging for CopyStaging {
    fn remote_dir(&self, local: &Path) -> String {
        let name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("case"));

        format!("{}/{name}", self.remote_root.trim_end_matches('/'))
    }

    fn stage_in(&self, session: &SshSession, local: &Path) -> Result<(), Failure> {
        session.run_checked(&format!("mkdir -p {}", quote(&self.remote_root)))?;
        session.copy(
            local.as_os_str().to_string_lossy().as_ref(),
            &session.remote_path(&format!("{}/", self.remote_root.trim_end_matches('/'))),
        )
    }

    fn stage_out(&self, session: &SshSession, local: &Path) -> Result<(), Failure> {
        let remote = self.remote_dir(local);
        let copied = session.copy(
            &session.remote_path(&format!("{remote}/*")),
            local.as_os_str().to_string_lossy().as_ref(),
        );

        if let Err(failure) = session.run_checked(&format!("rm -rf {}", quote(&remote))) {
            warn!(remote = %remote, failure = %failure, "Failed to clean remote directory");
        }

        copied
    }
}

/// How remote working directories are prepared
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum StagingConfig {
    #[default]
    Shared,
    Copy {
        remote_root: String,
    },
}

impl StagingConfig {
    pub fn build(&self) -> Arc<dyn Staging> {
        match self {
            Self::Shared => Arc::new(SharedFilesystem),
            Self::Copy { remote_root } => Arc::new(CopyStaging {
                remote_root: remote_root.clone(),
            }),
        }
    }
}

/// Destination of a remote calculator, `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn parse(host: &str) -> Result<Self, String> {
        match host.rsplit_once(':') {
            Some((destination, port)) => Ok(Self {
                destination: destination.to_string(),
                port: Some(
                    port.parse()
                        .map_err(|error| format!("invalid ssh port '{port}': {error}"))?,
                ),
            }),
            None => Ok(Self {
                destination: host.to_string(),
                port: None,
            }),
        }
    }
}

/// Thin wrapper over the `ssh`/ `scp` binaries for one target
#[derive(Debug)]
pub struct SshSession<'a> {
    ssh: &'a Path,
    scp: Option<&'a Path>,
    target: &'a SshTarget,
    connect_timeout: Duration,
}

impl SshSession<'_> {
    fn options(&self) -> Vec<String> {
        vec![
            String::from("-o"),
            String::from("BatchMode=yes"),
            String::from("-o"),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    /// ssh command running `remote_command` on the target
    pub fn command(&self, remote_command: &str) -> Command {
        let mut command = Command::new(self.ssh);
        command.args(self.options());

        if let Some(port) = self.target.port {
            command.arg("-p").arg(port.to_string());
        }

        command.arg(&self.target.destination).arg(remote_command);
        command
    }

    pub fn remote_path(&self, path: &str) -> String {
        format!("{}:{path}", self.target.destination)
    }

    /// run a short maintenance command, any failure is a transport failure
    pub fn run_checked(&self, remote_command: &str) -> Result<(), Failure> {
        let status = self
            .command(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|error| Failure::Transport(format!("failed to spawn ssh: {error}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(Failure::Transport(format!(
                "'{remote_command}' failed on {} with {status}",
                self.target.destination
            )))
        }
    }

    pub fn copy(&self, from: &str, to: &str) -> Result<(), Failure> {
        let scp = self
            .scp
            .ok_or_else(|| Failure::Transport(String::from("scp is not available")))?;
        let mut command = Command::new(scp);
        command.arg("-q").arg("-r").args(self.options());

        if let Some(port) = self.target.port {
            command.arg("-P").arg(port.to_string());
        }

        let status = command
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|error| Failure::Transport(format!("failed to spawn scp: {error}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(Failure::Transport(format!(
                "failed to copy {from} to {to}: {status}"
            )))
        }
    }
}

/// Calculator running the command on another host over ssh
#[derive(Debug)]
pub struct RemoteCalculator {
    pub(super) descriptor: CalculatorDescriptor,
    target: SshTarget,
    command: String,
    ssh: PathBuf,
    scp: Option<PathBuf>,
    staging: Arc<dyn Staging>,
    connect_timeout: Duration,
}

impl RemoteCalculator {
    pub fn load(
        descriptor: CalculatorDescriptor,
        host: String,
        command: String,
        settings: &CalculatorSettings,
    ) -> Result<Self, ConfigErrors> {
        let target = SshTarget::parse(&host).map_err(|reason| ConfigErrors::InvalidEndpoint {
            uri: descriptor.uri.clone(),
            reason,
        })?;
        let ssh = settings
            .resolver
            .resolve("ssh")
            .ok_or(ConfigErrors::MissingTool("ssh"))?;

        Ok(Self {
            descriptor,
            target,
            command,
            ssh,
            scp: settings.resolver.resolve("scp"),
            staging: settings.staging.clone(),
            connect_timeout: settings.connect_timeout,
        })
    }

    fn session(&self) -> SshSession<'_> {
        SshSession {
            ssh: &self.ssh,
            scp: self.scp.as_deref(),
            target: &self.target,
            connect_timeout: self.connect_timeout,
        }
    }

    /// full remote command line, runs inside the mapped directory
    pub fn remote_command(&self, local: &Path) -> String {
        format!(
            "cd {} && {}",
            quote(&self.staging.remote_dir(local)),
            self.command
        )
    }

    #[instrument(skip_all, fields(case = request.case.index, calculator = %self.descriptor), level = "debug")]
    pub fn execute(&self, request: &ExecutionRequest) -> Outcome {
        let session = self.session();

        if let Err(failure) = self.staging.stage_in(&session, request.dir) {
            return Outcome::Failure(failure);
        }

        let remote_command = self.remote_command(request.dir);
        debug!(remote_command = %remote_command, "Running remote command");

        let finished = run_captured(
            session.command(&remote_command),
            request.dir,
            request.timeout,
        );
        // also after a timeout, the remote directory is removed while staging out
        let staged = self.staging.stage_out(&session, request.dir);

        let status = match finished {
            Ok(status) => status,
            Err(failure) => {
                if let Err(staging) = staged {
                    debug!(failure = %staging, "Failed to stage out an unfinished case");
                }
                return Outcome::Failure(failure);
            }
        };

        match status.code() {
            Some(0) => match staged {
                Ok(()) => Outcome::Success(Success {
                    artifacts_dir: request.dir.to_path_buf(),
                    exit_status: Some(0),
                    outputs: None,
                }),
                Err(failure) => Outcome::Failure(failure),
            },
            Some(SSH_ERROR_STATUS) => Outcome::Failure(Failure::Transport(format!(
                "ssh to {} failed",
                self.target.destination
            ))),
            code => Outcome::Failure(Failure::Execution {
                status: code,
                message: format!("'{}' failed on {}", self.command, self.target.destination),
            }),
        }
    }
}

/// single quote for a POSIX shell
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
