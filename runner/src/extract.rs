use crate::case::{Outputs, Value};
use indexmap::IndexMap;
use std::{
    fmt::Debug,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// output name -> expression evaluated against a finished working directory
pub type OutputSpec = IndexMap<String, String>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to spawn extractor")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to wait for extractor")]
    Wait(#[source] std::io::Error),
    #[error("Extractor timeout")]
    Timeout,
    #[error("Failed to read extractor output")]
    Read(#[source] std::io::Error),
    #[error("Extractor exited with {0:?}")]
    Status(Option<i32>),
}

/// Reads output values from the artifacts of a finished case
pub trait Extractor: Debug + Send + Sync {
    /// Every requested name is present in the result, `None` marks values that couldn't be read
    fn extract(&self, outputs: &OutputSpec, dir: &Path) -> Outputs;
}

/// Runs each output expression with a POSIX shell inside the working directory
#[derive(Debug, Clone)]
pub struct ShellExtractor {
    shell: PathBuf,
    timeout: Duration,
}

impl ShellExtractor {
    pub fn new(shell: PathBuf, timeout: Duration) -> Self {
        Self { shell, timeout }
    }

    fn evaluate(&self, expression: &str, dir: &Path) -> Result<Option<Value>, ExtractError> {
        let mut handle = Command::new(&self.shell)
            .arg("-c")
            .arg(expression)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ExtractError::Spawn)?;

        // drained while waiting, a full pipe would stall the expression until the timeout
        let reader = handle.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                stdout.read_to_end(&mut buffer).map(|_| buffer)
            })
        });

        let status = match handle.wait_timeout(self.timeout).map_err(ExtractError::Wait)? {
            Some(status) => status,
            None => {
                // nothing to report if it already exited in between
                let _ = handle.kill();
                let _ = handle.wait();

                return Err(ExtractError::Timeout);
            }
        };

        if !status.success() {
            return Err(ExtractError::Status(status.code()));
        }

        let buffer = match reader.map(JoinHandle::join) {
            Some(Ok(read)) => read.map_err(ExtractError::Read)?,
            Some(Err(_)) => {
                return Err(ExtractError::Read(io::Error::new(
                    io::ErrorKind::Other,
                    "stdout reader panicked",
                )))
            }
            None => Vec::new(),
        };
        let buffer = String::from_utf8_lossy(&buffer);

        Ok(parse_value(&buffer))
    }
}

impl Extractor for ShellExtractor {
    fn extract(&self, outputs: &OutputSpec, dir: &Path) -> Outputs {
        outputs
            .iter()
            .map(|(name, expression)| {
                let value = match self.evaluate(expression, dir) {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(output = name.as_str(), error = %error, "Failed to extract output");
                        None
                    }
                };

                debug!(output = name.as_str(), value = ?value, "Extracted output");

                (name.clone(), value)
            })
            .collect()
    }
}

/// Interpret trimmed extractor output as a yaml scalar, empty output is null
pub fn parse_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return None;
    }

    match serde_yaml::from_str::<Value>(trimmed) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(trimmed.to_string())),
    }
}
