//! Deterministic model runners for engine tests and examples.

mod mock_model;

pub use mock_model::{ConstLogitsModel, FailingModel, NextTokenModel, ScriptedModel};
