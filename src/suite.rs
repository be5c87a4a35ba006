use std::collections::BTreeSet;

/// A case that is registered but deliberately not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSkip {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SuiteError {
    #[error("case \"{0}\" is registered twice")]
    Duplicate(String),
    #[error("case \"{0}\" is both active and an expected skip")]
    SkippedAndActive(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    name: String,
    cases: Vec<String>,
    skips: Vec<ExpectedSkip>,
}

impl Suite {
    pub fn new<C, S, R>(
        name: impl Into<String>,
        cases: impl IntoIterator<Item = C>,
        skips: impl IntoIterator<Item = (S, R)>,
    ) -> Result<Self, SuiteError>
    where
        C: Into<String>,
        S: Into<String>,
        R: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let mut suite = Suite {
            name: name.into(),
            cases: vec![],
            skips: vec![],
        };
        for case in cases {
            let case = case.into();
            if !seen.insert(case.clone()) {
                return Err(SuiteError::Duplicate(case));
            }
            suite.cases.push(case);
        }
        for (skip, reason) in skips {
            let skip = skip.into();
            if suite.cases.contains(&skip) {
                return Err(SuiteError::SkippedAndActive(skip));
            }
            if !seen.insert(skip.clone()) {
                return Err(SuiteError::Duplicate(skip));
            }
            suite.skips.push(ExpectedSkip {
                name: skip,
                reason: reason.into(),
            });
        }
        Ok(suite)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The executed set, in registration order.
    pub fn cases(&self) -> &[String] {
        &self.cases
    }

    pub fn skips(&self) -> &[ExpectedSkip] {
        &self.skips
    }

    pub fn is_active(&self, case: &str) -> bool {
        self.cases.iter().any(|x| x == case)
    }

    pub fn skip_reason(&self, case: &str) -> Option<&str> {
        self.skips
            .iter()
            .find(|x| x.name == case)
            .map(|x| x.reason.as_str())
    }
}

pub const SIMPLE_OPERATOR_CASES: &[&str] = &[
    "simple_mat_add",
    "simple_mat_add_mul_sub",
    "simple_mat_initialized",
    "simple_relu_tanh_sigmoid_softmax",
];

pub const SIMPLE_OPERATOR_SKIPS: &[(&str, &str)] = &[
    (
        "simple_dropout_layer",
        "the DML dropout implementation does not reproduce the reference output",
    ),
    (
        "simple_bool_and_or_xor_noshape",
        "the DML runtime cannot infer shapes of boolean matrices",
    ),
];

/// Element-wise arithmetic and activation models with their known gaps.
pub fn simple_operators() -> Suite {
    Suite {
        name: "simple_operators".to_string(),
        cases: SIMPLE_OPERATOR_CASES.iter().map(|x| x.to_string()).collect(),
        skips: SIMPLE_OPERATOR_SKIPS
            .iter()
            .map(|(name, reason)| ExpectedSkip {
                name: name.to_string(),
                reason: reason.to_string(),
            })
            .collect(),
    }
}
