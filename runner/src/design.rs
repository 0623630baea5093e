//! Iterative designs of experiments on top of the dispatcher.


use crate::{
    case::{
        display_value, fingerprint::Fingerprinter, generator::cases_from, Outputs, Value, Variables,
    },
    dispatcher::{DispatchError, Dispatcher},
    report::{CaseRow, Report},
};
use itertools::Itertools;
use std::iter;
use tracing::{debug, info, instrument};

/// Evaluated case as seen by a design algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub index: usize,
    pub variables: Variables,
    pub outputs: Outputs,
    /// the case succeeded and every output has a value
    pub valid: bool,
}

impl From<&CaseRow> for Evaluation {
    fn from(row: &CaseRow) -> Self {
        Self {
            index: row.index,
            variables: row.variables.clone(),
            outputs: row.outputs.clone(),
            valid: row.status.is_success() && row.outputs.values().all(Option::is_some),
        }
    }
}

/// A design of experiments. All mutable progress lives in `State`, owned by the caller and
/// passed back on every call.
pub trait Algorithm {
    type State;

    /// first batch of assignments together with the initial state
    fn initial_design(&self) -> (Self::State, Vec<Variables>);

    /// next batch given every evaluation so far, an empty batch ends the design
    fn next_design(&self, state: &mut Self::State, evaluations: &[Evaluation]) -> Vec<Variables>;

    /// human readable result of the design
    fn analysis(&self, state: &Self::State, evaluations: &[Evaluation]) -> String;
}

/// One batch of fixed assignments, no further iterations
#[derive(Debug, Clone, Default)]
pub struct FixedDesign {
    assignments: Vec<Variables>,
}

impl FixedDesign {
    pub fn new(assignments: Vec<Variables>) -> Self {
        Self { assignments }
    }
}

impl Algorithm for FixedDesign {
    type State = ();

    fn initial_design(&self) -> (Self::State, Vec<Variables>) {
        ((), self.assignments.clone())
    }

    fn next_design(&self, _state: &mut Self::State, _evaluations: &[Evaluation]) -> Vec<Variables> {
        Vec::new()
    }

    /// min/ mean/ max of every numeric output over the valid evaluations
    fn analysis(&self, _state: &Self::State, evaluations: &[Evaluation]) -> String {
        let names = evaluations
            .iter()
            .flat_map(|evaluation| evaluation.outputs.keys())
            .unique()
            .collect_vec();

        names
            .into_iter()
            .map(|name| {
                let values = evaluations
                    .iter()
                    .filter(|evaluation| evaluation.valid)
                    .filter_map(|evaluation| evaluation.outputs.get(name)?.as_ref())
                    .filter_map(|value| value.as_f64())
                    .collect_vec();

                if values.is_empty() {
                    return format!("{name}: no numeric values");
                }

                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mean = values.iter().sum::<f64>() / values.len() as f64;

                format!(
                    "{name}: {} value(s), min {}, mean {}, max {}",
                    values.len(),
                    display_value(&Value::from(min)),
                    display_value(&Value::from(mean)),
                    display_value(&Value::from(max))
                )
            })
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct DesignReport {
    pub iterations: usize,
    pub evaluations: Vec<Evaluation>,
    pub valid: usize,
    pub analysis: String,
    /// every case of every iteration
    pub report: Report,
}

/// Drive `algorithm` for at most `max_iterations` batches. Case indices continue across
/// batches, so every case of the design has a distinct index.
#[instrument(skip_all, fields(max_iterations = max_iterations), level = "info")]
pub fn run_design<A: Algorithm>(
    algorithm: &A,
    dispatcher: &Dispatcher,
    max_iterations: usize,
) -> Result<DesignReport, DispatchError> {
    let fingerprinter = Fingerprinter::new(
        dispatcher.renderer().identity(),
        dispatcher.outputs().keys(),
    );
    let (mut state, mut batch) = algorithm.initial_design();
    let mut report = Report::new(iter::empty(), dispatcher.outputs()).with_iterations(0);
    let mut evaluations: Vec<Evaluation> = Vec::new();

    while !batch.is_empty() && report.summary.iterations < max_iterations {
        let first_index = report.rows.len();
        let iteration = report.summary.iterations + 1;
        info!(iteration = iteration, cases = batch.len(), "Starting iteration");

        let cases = cases_from(batch, &fingerprinter, first_index);
        let result = dispatcher.run(cases)?;

        evaluations.extend(result.rows.iter().map(Evaluation::from));
        report.extend(result);

        batch = algorithm.next_design(&mut state, &evaluations);
        debug!(next = batch.len(), "Algorithm proposed next batch");
    }

    let valid = evaluations
        .iter()
        .filter(|evaluation| evaluation.valid)
        .count();

    Ok(DesignReport {
        iterations: report.summary.iterations,
        valid,
        analysis: algorithm.analysis(&state, &evaluations),
        evaluations,
        report,
    })
}
