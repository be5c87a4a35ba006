use crate::tensor::Matrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element-wise acceptance: `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-7,
        }
    }
}

impl Tolerance {
    pub fn exact() -> Self {
        Self { rtol: 0.0, atol: 0.0 }
    }

    pub fn allows(&self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual.is_infinite() || expected.is_infinite() {
            return actual == expected;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Mismatch {
    #[error("output \"{output}\" was not produced (produced: {produced:?})")]
    MissingOutput { output: String, produced: Vec<String> },
    #[error("output \"{output}\" has shape {actual:?}, expected {expected:?}")]
    Shape {
        output: String,
        actual: (usize, usize),
        expected: (usize, usize),
    },
    #[error(
        "output \"{output}\" differs at ({row}, {col}): actual {actual} vs expected {expected} \
         ({divergent} divergent element(s), max deviation {max_deviation})"
    )]
    Value {
        output: String,
        row: usize,
        col: usize,
        actual: f64,
        expected: f64,
        divergent: usize,
        max_deviation: f64,
    },
}

impl Mismatch {
    pub fn output(&self) -> &str {
        match self {
            Mismatch::MissingOutput { output, .. }
            | Mismatch::Shape { output, .. }
            | Mismatch::Value { output, .. } => output,
        }
    }
}

/// Result of comparing all captured outputs of one case.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub compared_outputs: usize,
    pub compared_elements: usize,
    /// Largest absolute deviation over every compared element, NaN pairs excluded.
    pub max_deviation: f64,
    /// First failure in output-name order; `None` means the case passed.
    pub mismatch: Option<Mismatch>,
}

impl ComparisonResult {
    pub fn passed(&self) -> bool {
        self.mismatch.is_none()
    }
}

fn deviation(actual: f64, expected: f64) -> f64 {
    if actual.is_nan() && expected.is_nan() || actual == expected {
        0.0
    } else {
        (actual - expected).abs()
    }
}

/// Compares one matrix. Returns the largest deviation seen and the first
/// divergent element in row-major order.
pub fn compare_matrix(
    output: &str,
    actual: &Matrix,
    expected: &Matrix,
    tolerance: &Tolerance,
) -> (f64, Option<Mismatch>) {
    if actual.dim() != expected.dim() {
        return (
            f64::NAN,
            Some(Mismatch::Shape {
                output: output.to_string(),
                actual: actual.dim(),
                expected: expected.dim(),
            }),
        );
    }

    let mut max_deviation: f64 = 0.0;
    let mut first = None;
    let mut divergent = 0;
    for (((row, col), actual_value), expected_value) in actual.indexed_iter().zip(expected.iter()) {
        max_deviation = max_deviation.max(deviation(*actual_value, *expected_value));
        if !tolerance.allows(*actual_value, *expected_value) {
            divergent += 1;
            if first.is_none() {
                first = Some((row, col, *actual_value, *expected_value));
            }
        }
    }

    let mismatch = first.map(|(row, col, actual, expected)| Mismatch::Value {
        output: output.to_string(),
        row,
        col,
        actual,
        expected,
        divergent,
        max_deviation,
    });
    (max_deviation, mismatch)
}

/// Compares every expected output against the captured ones. Captured outputs
/// without an expectation are not compared.
pub fn compare_outputs(
    actual: &BTreeMap<String, Matrix>,
    expected: &BTreeMap<String, Matrix>,
    tolerance: &Tolerance,
) -> ComparisonResult {
    let mut result = ComparisonResult {
        compared_outputs: 0,
        compared_elements: 0,
        max_deviation: 0.0,
        mismatch: None,
    };

    for (name, expected_matrix) in expected {
        let Some(actual_matrix) = actual.get(name) else {
            result.mismatch.get_or_insert_with(|| Mismatch::MissingOutput {
                output: name.clone(),
                produced: actual.keys().cloned().collect(),
            });
            continue;
        };
        let (max_deviation, mismatch) = compare_matrix(name, actual_matrix, expected_matrix, tolerance);
        result.compared_outputs += 1;
        if !max_deviation.is_nan() {
            result.compared_elements += expected_matrix.len();
            result.max_deviation = result.max_deviation.max(max_deviation);
        }
        if let Some(mismatch) = mismatch {
            result.mismatch.get_or_insert(mismatch);
        }
    }

    result
}
