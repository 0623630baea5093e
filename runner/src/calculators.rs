pub mod cache;
pub mod daemon;
pub mod local;
pub mod remote;

#[cfg(test)]
mod calculators_test;

use crate::{
    case::{Case, Outputs},
    config::ConfigErrors,
    discovery::DiscoveryService,
    resolve::ToolResolver,
};
use remote::Staging;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// Why a single attempt failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Failure {
    /// backend unreachable: spawn failure, connection error, discovery timeout
    #[error("transport error: {0}")]
    Transport(String),
    /// the delegated calculation itself failed
    #[error("calculation failed (exit status {status:?}): {message}")]
    Execution {
        status: Option<i32>,
        message: String,
    },
    /// inputs could not be produced, retrying would not change anything
    #[error("failed to render inputs: {0}")]
    Render(String),
}

impl Failure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Render(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Success {
    pub artifacts_dir: PathBuf,
    pub exit_status: Option<i32>,
    /// already known outputs, only set for cache hits
    pub outputs: Option<Outputs>,
}

/// Result of asking a calculator for a case
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Success),
    Failure(Failure),
    /// only produced by cache calculators, never counts as an attempt
    CacheMiss,
}

impl Outcome {
    pub fn failure(failure: Failure) -> Self {
        Self::Failure(failure)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(success) => match success.exit_status {
                Some(status) => write!(f, "success (exit status {status})"),
                None => write!(f, "success"),
            },
            Self::Failure(failure) => write!(f, "{failure}"),
            Self::CacheMiss => write!(f, "cache miss"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Local,
    Ssh,
    Cache,
    Daemon,
}

/// Where a daemon calculator is found
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonTarget {
    /// `host:port` of the daemon's job socket
    Direct(String),
    /// resolve by listening for announcements, `None` uses the configured discovery port
    Discover { udp_port: Option<u16> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Local { command: String },
    Remote { host: String, command: String },
    Cache { pattern: String },
    Daemon { target: DaemonTarget, code: String },
}

impl Endpoint {
    pub fn scheme(&self) -> Scheme {
        match self {
            Self::Local { .. } => Scheme::Local,
            Self::Remote { .. } => Scheme::Ssh,
            Self::Cache { .. } => Scheme::Cache,
            Self::Daemon { .. } => Scheme::Daemon,
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| String::from("missing '<scheme>://'"))?;
        let non_empty = |value: &str, what: &str| {
            let value = value.trim();

            if value.is_empty() {
                Err(format!("{what} must not be empty"))
            } else {
                Ok(value.to_string())
            }
        };

        match scheme {
            "sh" => Ok(Self::Local {
                command: non_empty(rest, "command")?,
            }),
            "ssh" => {
                let (host, command) = rest
                    .split_once('/')
                    .ok_or_else(|| String::from("expected ssh://<host>/<command>"))?;

                Ok(Self::Remote {
                    host: non_empty(host, "host")?,
                    command: non_empty(command, "command")?,
                })
            }
            "cache" => Ok(Self::Cache {
                pattern: non_empty(rest, "glob pattern")?,
            }),
            "funz" => {
                let (authority, code) = rest
                    .split_once('/')
                    .ok_or_else(|| String::from("expected funz://[host][:port]/<code>"))?;
                let code = non_empty(code, "code")?;

                if code.contains('/') {
                    return Err(format!("code '{code}' must not contain '/'"));
                }

                let target = match authority.split_once(':') {
                    None if authority.is_empty() => DaemonTarget::Discover { udp_port: None },
                    None => return Err(format!("daemon host '{authority}' needs a port")),
                    Some((host, port)) => {
                        let port = port
                            .parse::<u16>()
                            .map_err(|error| format!("invalid port '{port}': {error}"))?;

                        if host.is_empty() {
                            DaemonTarget::Discover {
                                udp_port: (port != 0).then_some(port),
                            }
                        } else if port == 0 {
                            return Err(format!("daemon at '{host}' needs a non-zero port"));
                        } else {
                            DaemonTarget::Direct(format!("{host}:{port}"))
                        }
                    }
                };

                Ok(Self::Daemon { target, code })
            }
            other => Err(format!("unsupported scheme '{other}'")),
        }
    }
}

/// A parsed calculator entry of the configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalculatorDescriptor {
    pub uri: String,
    pub endpoint: Endpoint,
    pub max_concurrency: usize,
}

impl CalculatorDescriptor {
    pub fn parse(uri: &str, max_concurrency: usize) -> Result<Self, ConfigErrors> {
        let endpoint = uri
            .parse::<Endpoint>()
            .map_err(|reason| ConfigErrors::InvalidEndpoint {
                uri: uri.to_string(),
                reason,
            })?;

        if max_concurrency == 0 {
            return Err(ConfigErrors::InvalidEndpoint {
                uri: uri.to_string(),
                reason: String::from("concurrency must be at least 1"),
            });
        }

        Ok(Self {
            uri: uri.to_string(),
            endpoint,
            max_concurrency,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.endpoint.scheme()
    }

    pub fn is_cache(&self) -> bool {
        self.scheme() == Scheme::Cache
    }
}

impl Display for CalculatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Everything a calculator needs besides its own descriptor
#[derive(Debug, Clone)]
pub struct CalculatorSettings {
    pub resolver: Arc<dyn ToolResolver>,
    pub discovery: Arc<DiscoveryService>,
    pub staging: Arc<dyn Staging>,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

/// One attempt of a case in a prepared working directory
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub case: &'a Case,
    pub dir: &'a Path,
    pub timeout: Option<Duration>,
}

/// All calculator variants, selected by the endpoint scheme
#[derive(Debug)]
pub enum Calculators {
    Local(local::LocalCalculator),
    Remote(remote::RemoteCalculator),
    Cache(cache::CacheCalculator),
    Daemon(daemon::DaemonCalculator),
}

impl Calculators {
    pub fn load(
        descriptor: CalculatorDescriptor,
        settings: &CalculatorSettings,
    ) -> Result<Self, ConfigErrors> {
        match descriptor.endpoint.clone() {
            Endpoint::Local { command } => Ok(Self::Local(local::LocalCalculator::load(
                descriptor, command, settings,
            )?)),
            Endpoint::Remote { host, command } => Ok(Self::Remote(
                remote::RemoteCalculator::load(descriptor, host, command, settings)?,
            )),
            Endpoint::Cache { pattern } => Ok(Self::Cache(cache::CacheCalculator::load(
                descriptor, pattern,
            )?)),
            Endpoint::Daemon { target, code } => Ok(Self::Daemon(
                daemon::DaemonCalculator::load(descriptor, target, code, settings),
            )),
        }
    }

    pub fn execute(&self, request: &ExecutionRequest) -> Outcome {
        match self {
            Self::Local(calculator) => calculator.execute(request),
            Self::Remote(calculator) => calculator.execute(request),
            Self::Cache(calculator) => calculator.execute(request),
            Self::Daemon(calculator) => calculator.execute(request),
        }
    }

    pub fn descriptor(&self) -> &CalculatorDescriptor {
        match self {
            Self::Local(calculator) => &calculator.descriptor,
            Self::Remote(calculator) => &calculator.descriptor,
            Self::Cache(calculator) => &calculator.descriptor,
            Self::Daemon(calculator) => &calculator.descriptor,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.descriptor().max_concurrency
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}
