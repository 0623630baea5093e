use super::{display_value, Value, Variables};
use itertools::Itertools;
use sha2::{Digest, Sha256};

/// length of the hex encoded fingerprint
pub const FINGERPRINT_LENGTH: usize = 16;

/// Computes stable case fingerprints from the template identity, the variable assignment and the
/// requested output names. Ordering of variables and outputs does not matter.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    template: String,
    outputs: Vec<String>,
}

impl Fingerprinter {
    pub fn new<I, S>(template: impl Into<String>, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            template: template.into(),
            outputs: outputs.into_iter().map(Into::into).sorted().dedup().collect(),
        }
    }

    pub fn fingerprint(&self, variables: &Variables) -> String {
        let mut hasher = Sha256::new();

        hasher.update(b"template\0");
        hasher.update(self.template.as_bytes());

        for (name, value) in variables.iter().sorted_by(|(a, _), (b, _)| a.cmp(b)) {
            hasher.update(b"\0variable\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(canonical_value(value).as_bytes());
        }

        for output in self.outputs.iter() {
            hasher.update(b"\0output\0");
            hasher.update(output.as_bytes());
        }

        let mut digest = format!("{:x}", hasher.finalize());
        digest.truncate(FINGERPRINT_LENGTH);

        digest
    }
}

fn canonical_value(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| display_value(value))
}
