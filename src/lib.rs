// src/lib.rs
pub mod check;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod grader;
pub mod models;
pub mod sandbox;

pub use config::{EnvLabels, EvaluateOptions, GraderConfig, GradingSpec};
pub use errors::{GradeError, Result};
pub use feedback::{FeedbackElement, FeedbackStyle, Grade, GradeType};
pub use grader::Grader;
pub use models::{Feedback, PassOutcome, PassReport};
