use crate::{
    case::{display_value, Case, CaseStatus, Outputs, Value, Variables},
    extract::OutputSpec,
};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const RESULTS_YAML: &str = "results.yaml";
pub const RESULTS_TSV: &str = "results.tsv";

/// One row of the aggregated table
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CaseRow {
    pub index: usize,
    pub fingerprint: String,
    pub status: CaseStatus,
    pub attempts: usize,
    pub variables: Variables,
    pub outputs: Outputs,
}

impl From<&Case> for CaseRow {
    fn from(case: &Case) -> Self {
        Self {
            index: case.index,
            fingerprint: case.fingerprint.clone(),
            status: case.status,
            attempts: case.attempts.len(),
            variables: case.variables().clone(),
            outputs: case.outputs.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub iterations: usize,
    pub cases: usize,
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    /// executed jobs, cache hits are not evaluations
    pub evaluations: usize,
    /// cases where every requested output has a value
    pub valid: usize,
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} iteration(s), {} evaluation(s): {} case(s), {} succeeded, {} cached, {} failed, {} valid",
            self.iterations,
            self.evaluations,
            self.cases,
            self.succeeded,
            self.cached,
            self.failed,
            self.valid
        )
    }
}

/// Combined results of a run, ordered by case index
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Report {
    pub outputs: Vec<String>,
    pub rows: Vec<CaseRow>,
    pub summary: Summary,
}

impl Report {
    pub fn new<'a>(cases: impl IntoIterator<Item = &'a Case>, outputs: &OutputSpec) -> Self {
        let mut rows: Vec<CaseRow> = cases.into_iter().map(CaseRow::from).collect();
        rows.sort_by_key(|row| row.index);

        let count = |status| rows.iter().filter(|row| row.status == status).count();
        let summary = Summary {
            iterations: 1,
            cases: rows.len(),
            succeeded: count(CaseStatus::Succeeded),
            cached: count(CaseStatus::Cached),
            failed: count(CaseStatus::Failed),
            evaluations: rows.iter().map(|row| row.attempts).sum(),
            valid: rows
                .iter()
                .filter(|row| {
                    row.status.is_success() && row.outputs.values().all(Option::is_some)
                })
                .count(),
        };

        Self {
            outputs: outputs.keys().cloned().collect(),
            rows,
            summary,
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.summary.iterations = iterations;
        self
    }

    /// append the cases of a later iteration
    pub fn extend(&mut self, other: Report) {
        let Summary {
            iterations,
            cases,
            succeeded,
            cached,
            failed,
            evaluations,
            valid,
        } = other.summary;

        self.summary.iterations += iterations;
        self.summary.cases += cases;
        self.summary.succeeded += succeeded;
        self.summary.cached += cached;
        self.summary.failed += failed;
        self.summary.evaluations += evaluations;
        self.summary.valid += valid;

        self.rows.extend(other.rows);
        self.rows.sort_by_key(|row| row.index);
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn row(&self, index: usize) -> Option<&CaseRow> {
        self.rows.iter().find(|row| row.index == index)
    }

    /// value of `output` for case `index`, `None` for unknown cases and null outputs alike
    pub fn output(&self, index: usize, output: &str) -> Option<&Value> {
        self.row(index)?.outputs.get(output)?.as_ref()
    }

    /// Tab separated table, one row per case, `null` for missing values
    pub fn table(&self) -> String {
        let variables: IndexSet<&String> = self
            .rows
            .iter()
            .flat_map(|row| row.variables.keys())
            .collect();

        let header = ["index", "status"]
            .into_iter()
            .map(String::from)
            .chain(variables.iter().map(|name| name.to_string()))
            .chain(self.outputs.iter().cloned())
            .collect::<Vec<_>>()
            .join("\t");

        let lines = self.rows.iter().map(|row| {
            let cell = |value: Option<&Value>| value.map_or(String::from("null"), display_value);

            [row.index.to_string(), status_name(row.status).to_string()]
                .into_iter()
                .chain(
                    variables
                        .iter()
                        .map(|name| cell(row.variables.get(*name))),
                )
                .chain(
                    self.outputs
                        .iter()
                        .map(|name| cell(row.outputs.get(name).and_then(Option::as_ref))),
                )
                .collect::<Vec<_>>()
                .join("\t")
        });

        std::iter::once(header)
            .chain(lines)
            .map(|line| line + "\n")
            .collect()
    }

    /// Write `results.yaml` and `results.tsv` below `root`
    pub fn write(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let yaml = root.join(RESULTS_YAML);
        let tsv = root.join(RESULTS_TSV);

        fs::write(
            &yaml,
            serde_yaml::to_string(self)
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?,
        )?;
        fs::write(&tsv, self.table())?;
        info!(yaml = ?yaml, tsv = ?tsv, "Wrote report");

        Ok(vec![yaml, tsv])
    }
}

fn status_name(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Pending => "pending",
        CaseStatus::Running => "running",
        CaseStatus::Succeeded => "succeeded",
        CaseStatus::Failed => "failed",
        CaseStatus::Cached => "cached",
    }
}
