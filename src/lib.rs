pub mod compare;
pub mod config;
pub mod converter;
pub mod dml_io;
pub mod dtype;
pub mod error;
pub mod fixture;
pub mod model;
pub mod observer;
pub mod onnx;
pub mod runner;
pub mod runtime;
pub mod suite;
pub mod tensor;

pub use compare::{ComparisonResult, Mismatch, Tolerance};
pub use config::HarnessConfig;
pub use converter::{CommandConverter, Converter, ConverterError};
pub use error::{FailureKind, HarnessError, Stage};
pub use fixture::{DirectoryFixtureStore, Fixture, FixtureError, FixtureStore};
pub use model::OnnxModel;
pub use runner::{CaseReport, CaseState, FixtureRunner, Outcome, SuiteReport};
pub use runtime::{ExecutionRequest, RuntimeError, ScriptRuntime, SystemDsRuntime};
pub use suite::{ExpectedSkip, Suite};
pub use tensor::Matrix;
