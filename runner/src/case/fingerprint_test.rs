use super::{
    fingerprint::{Fingerprinter, FINGERPRINT_LENGTH},
    Value, Variables,
};

fn variables(pairs: &[(&str, f64)]) -> Variables {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Value::from(*value)))
        .collect()
}

#[test]
fn fingerprint_is_stable() {
    let fingerprinter = Fingerprinter::new("abc", ["pressure"]);
    let vars = variables(&[("T", 20.0), ("V", 1.0)]);

    let first = fingerprinter.fingerprint(&vars);
    let second = Fingerprinter::new("abc", ["pressure"]).fingerprint(&vars);

    assert_eq!(first, second);
    assert_eq!(first.len(), FINGERPRINT_LENGTH);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn fingerprint_ignores_ordering() {
    let fingerprinter = Fingerprinter::new("abc", ["a", "b"]);
    let reordered = Fingerprinter::new("abc", ["b", "a"]);

    assert_eq!(
        fingerprinter.fingerprint(&variables(&[("T", 20.0), ("V", 1.0)])),
        reordered.fingerprint(&variables(&[("V", 1.0), ("T", 20.0)]))
    );
}

#[test]
fn fingerprint_depends_on_all_inputs() {
    let base = Fingerprinter::new("abc", ["pressure"]);
    let vars = variables(&[("T", 20.0)]);
    let reference = base.fingerprint(&vars);

    assert_ne!(
        reference,
        Fingerprinter::new("abd", ["pressure"]).fingerprint(&vars)
    );
    assert_ne!(
        reference,
        Fingerprinter::new("abc", ["volume"]).fingerprint(&vars)
    );
    assert_ne!(reference, base.fingerprint(&variables(&[("T", 25.0)])));
}

#[test]
fn fingerprint_of_empty_assignment() {
    let fingerprinter = Fingerprinter::new("", Vec::<String>::new());
    let empty = fingerprinter.fingerprint(&Variables::new());

    assert_eq!(empty, fingerprinter.fingerprint(&Variables::new()));
    assert_ne!(empty, fingerprinter.fingerprint(&variables(&[("x", 0.0)])));
}
