use super::{CalculatorDescriptor, ExecutionRequest, Outcome, Success};
use crate::{config::ConfigErrors, store};
use tracing::{instrument, warn};

/// Pseudo calculator answering cases from previously persisted results
#[derive(Debug)]
pub struct CacheCalculator {
    pub(super) descriptor: CalculatorDescriptor,
    pattern: String,
}

impl CacheCalculator {
    pub fn load(descriptor: CalculatorDescriptor, pattern: String) -> Result<Self, ConfigErrors> {
        store::compile_pattern(&pattern).map_err(|error| ConfigErrors::InvalidEndpoint {
            uri: descriptor.uri.clone(),
            reason: match error {
                store::StoreError::Glob(error) => error.to_string(),
                other => other.to_string(),
            },
        })?;

        Ok(Self {
            descriptor,
            pattern,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// A hit returns the cached directory and its outputs, anything else is a miss
    #[instrument(skip_all, fields(case = request.case.index, pattern = %self.pattern), level = "debug")]
    pub fn execute(&self, request: &ExecutionRequest) -> Outcome {
        match store::lookup(&self.pattern, &request.case.fingerprint) {
            Ok(Some(record)) => Outcome::Success(Success {
                artifacts_dir: record.artifacts_dir,
                exit_status: None,
                outputs: Some(record.outputs),
            }),
            Ok(None) => Outcome::CacheMiss,
            Err(error) => {
                warn!(error = %error, "Cache lookup failed, treating it as a miss");
                Outcome::CacheMiss
            }
        }
    }
}
