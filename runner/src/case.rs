pub mod fingerprint;
pub mod generator;

#[cfg(test)]
mod fingerprint_test;

use crate::calculators::{CalculatorDescriptor, Outcome};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Value of a single variable or output, kept untyped until render/ extract time
pub type Value = serde_yaml::Value;

/// variable name -> value, in declaration order
pub type Variables = IndexMap<String, Value>;

/// output name -> value, `None` if the value could not be extracted
pub type Outputs = IndexMap<String, Option<Value>>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cached,
}

impl CaseStatus {
    /// true once the dispatcher will not touch the case anymore
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cached)
    }

    /// true if the case holds usable outputs
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }
}

/// One execution attempt of a case on a calculator
#[derive(Clone, Debug)]
pub struct Job {
    pub case: usize,
    pub calculator: CalculatorDescriptor,
    pub attempt: usize,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub result: Outcome,
}

/// One concrete parameter assignment to be evaluated
#[derive(Clone, Debug)]
pub struct Case {
    pub index: usize,
    variables: Variables,
    pub fingerprint: String,
    pub status: CaseStatus,
    pub attempts: Vec<Job>,
    pub outputs: Outputs,
}

impl Case {
    pub fn new(index: usize, variables: Variables, fingerprint: String) -> Self {
        Self {
            index,
            variables,
            fingerprint,
            status: CaseStatus::Pending,
            attempts: Vec::new(),
            outputs: Outputs::new(),
        }
    }

    /// the variable assignment is fixed at creation
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// set every requested output to null, used for terminally failed cases
    pub fn null_outputs<'a>(&mut self, names: impl Iterator<Item = &'a String>) {
        self.outputs = names.map(|name| (name.clone(), None)).collect();
    }

    /// true if every requested output could be extracted
    pub fn is_valid(&self) -> bool {
        self.status.is_success() && self.outputs.values().all(Option::is_some)
    }
}

/// Render a value the way it is substituted into templates and written into tables
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::from("null"),
        Value::Bool(boolean) => boolean.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(string) => string.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| String::from("?")),
    }
}
