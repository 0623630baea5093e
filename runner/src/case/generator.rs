use super::{fingerprint::Fingerprinter, Case, Value, Variables};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How the variable assignments of a run are declared
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum DesignSpec {
    /// Cartesian product over all list values, scalars are constants applied to every case.
    /// The first declared variable varies slowest.
    Factorial(IndexMap<String, Value>),
    /// One case per row, in row order
    Rows(Vec<Variables>),
}

impl DesignSpec {
    /// Expand the design into ordered variable assignments.
    /// Values are not validated here, a malformed value only fails its own case later on.
    pub fn assignments(&self) -> Vec<Variables> {
        match self {
            Self::Rows(rows) => rows.clone(),
            Self::Factorial(variables) => {
                let axes = variables
                    .iter()
                    .filter_map(|(name, value)| match value {
                        Value::Sequence(values) => Some((name, values)),
                        _ => None,
                    })
                    .collect_vec();

                if axes.iter().any(|(_, values)| values.is_empty()) {
                    warn!("Factorial design contains an empty list, no cases are generated");
                    return Vec::new();
                }

                // older itertools yield nothing for a product over zero axes
                let combinations = if axes.is_empty() {
                    vec![Vec::new()]
                } else {
                    axes.iter()
                        .map(|(_, values)| values.iter())
                        .multi_cartesian_product()
                        .collect_vec()
                };

                debug!(
                    axes = axes.len(),
                    cases = combinations.len(),
                    "Expanded factorial design"
                );

                combinations
                    .into_iter()
                    .map(|combination| {
                        let mut picked = combination.into_iter();

                        variables
                            .iter()
                            .map(|(name, value)| {
                                let value = match value {
                                    Value::Sequence(_) => {
                                        picked.next().cloned().unwrap_or(Value::Null)
                                    }
                                    constant => constant.clone(),
                                };

                                (name.clone(), value)
                            })
                            .collect()
                    })
                    .collect()
            }
        }
    }

    /// Build cases with sequential indices starting at `first_index`
    pub fn cases(&self, fingerprinter: &Fingerprinter, first_index: usize) -> Vec<Case> {
        cases_from(self.assignments(), fingerprinter, first_index)
    }
}

/// Turn assignments into fingerprinted cases with sequential indices
pub fn cases_from(
    assignments: Vec<Variables>,
    fingerprinter: &Fingerprinter,
    first_index: usize,
) -> Vec<Case> {
    assignments
        .into_iter()
        .enumerate()
        .map(|(offset, variables)| {
            let fingerprint = fingerprinter.fingerprint(&variables);

            Case::new(first_index + offset, variables, fingerprint)
        })
        .collect()
}
