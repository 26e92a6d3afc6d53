// src/config.rs
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::errors::{GradeError, Result};

/// Time limit applied to every grading evaluation unless overridden.
pub const DEFAULT_TIMELIMIT_MS: u64 = 600_000;

pub const ENGINE_BINDING: &str = ".engine";
pub const LABEL_BINDING: &str = ".label";
pub const USER_CODE_BINDING: &str = ".user_code";
pub const ENVIR_PREP_BINDING: &str = ".envir_prep";
pub const ENVIR_RESULT_BINDING: &str = ".envir_result";
pub const EVALUATE_RESULT_BINDING: &str = ".evaluate_result";

/// Names bound into every grading scope besides the last-value aliases.
pub const FIXED_BINDINGS: [&str; 6] = [
    ENGINE_BINDING,
    LABEL_BINDING,
    USER_CODE_BINDING,
    ENVIR_PREP_BINDING,
    ENVIR_RESULT_BINDING,
    EVALUATE_RESULT_BINDING,
];

const BINDING_NAME_PATTERN: &str = r"^\.?[A-Za-z][A-Za-z0-9_.]*$";
const SCOPE_LABEL_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_-]*$";

/// Grading code attached to an exercise by the document author.
///
/// Only `check` is consumed by the grader; the other fields are carried so a
/// full exercise definition can be deserialized without loss.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GradingSpec {
    #[serde(default)]
    pub code_check: Option<String>,

    #[serde(default)]
    pub error_check: Option<String>,

    #[serde(default)]
    pub check: Option<String>,

    #[serde(default)]
    pub solution: Option<String>,
}

impl GradingSpec {
    pub fn with_check(check: impl Into<String>) -> Self {
        Self {
            check: Some(check.into()),
            ..Self::default()
        }
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_toml(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Returns the `check` source, rejecting a missing or blank field.
    pub fn check_code(&self) -> Result<&str> {
        match self.check.as_deref() {
            Some(code) if !code.trim().is_empty() => Ok(code),
            _ => Err(GradeError::MissingCheck),
        }
    }
}

/// Labels of the sandbox scopes the grader reads from or writes to.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EnvLabels {
    pub prep: String,
    pub result: String,
    pub grading: String,
}

impl Default for EnvLabels {
    fn default() -> Self {
        Self {
            prep: "prep".to_string(),
            result: "result".to_string(),
            grading: "grading".to_string(),
        }
    }
}

/// Options handed to the evaluator for a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluateOptions {
    pub envir: String,
    pub eval: bool,
    pub echo: bool,
    pub warning: bool,
    pub error: bool,
    pub include: bool,
    pub output: bool,
    pub timelimit: Duration,
}

impl EvaluateOptions {
    /// The fixed profile every grading evaluation runs under, regardless of
    /// the options that drove the user's own run.
    pub fn grading(envir: impl Into<String>, timelimit: Duration) -> Self {
        Self {
            envir: envir.into(),
            eval: true,
            echo: false,
            warning: true,
            error: false,
            include: true,
            output: true,
            timelimit,
        }
    }

    pub fn timelimit_ms(&self) -> u64 {
        self.timelimit.as_millis() as u64
    }
}

/// Grader configuration, loaded from TOML and/or environment variables.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GraderConfig {
    /// Engine identifier bound as `.engine`.
    pub engine: String,

    pub timelimit_ms: u64,

    /// Every name the last computed value is bound under. Checking code
    /// written for different conventions expects different names.
    pub last_value_aliases: Vec<String>,

    /// Class tag marking a result as a structured grade.
    pub graded_class: String,

    /// Private name a callable check is bound under before being invoked.
    pub check_function: String,

    pub labels: EnvLabels,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            engine: "r".to_string(),
            timelimit_ms: DEFAULT_TIMELIMIT_MS,
            last_value_aliases: vec![
                ".last_value".to_string(),
                ".result".to_string(),
                ".user".to_string(),
            ],
            graded_class: "gradethis_graded".to_string(),
            check_function: ".checkFunction".to_string(),
            labels: EnvLabels::default(),
        }
    }
}

impl GraderConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `GRADER_*` overrides looked up through `lookup`, then validates.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("GRADER_ENGINE") {
            self.engine = engine.trim().to_string();
        }

        if let Some(raw) = lookup("GRADER_TIMELIMIT_MS") {
            self.timelimit_ms = raw.trim().parse().map_err(|_| {
                GradeError::Config(format!("GRADER_TIMELIMIT_MS is not a number: '{}'", raw))
            })?;
        }

        if let Some(raw) = lookup("GRADER_LAST_VALUE_ALIASES") {
            self.last_value_aliases = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(class) = lookup("GRADER_GRADED_CLASS") {
            self.graded_class = class.trim().to_string();
        }

        self.validate()?;
        Ok(self)
    }

    pub fn timelimit(&self) -> Duration {
        Duration::from_millis(self.timelimit_ms)
    }

    /// The binding names setup will produce, in bind order.
    pub fn binding_names(&self) -> Vec<&str> {
        let mut names = vec![ENGINE_BINDING, LABEL_BINDING, USER_CODE_BINDING];
        names.extend(self.last_value_aliases.iter().map(String::as_str));
        names.extend([ENVIR_PREP_BINDING, ENVIR_RESULT_BINDING, EVALUATE_RESULT_BINDING]);
        names
    }

    pub fn validate(&self) -> Result<()> {
        let name_re = Regex::new(BINDING_NAME_PATTERN)
            .map_err(|e| GradeError::Config(e.to_string()))?;
        let label_re = Regex::new(SCOPE_LABEL_PATTERN)
            .map_err(|e| GradeError::Config(e.to_string()))?;

        if self.engine.is_empty() {
            return Err(GradeError::Config("engine must not be empty".to_string()));
        }
        if self.timelimit_ms == 0 {
            return Err(GradeError::Config("timelimit_ms must be positive".to_string()));
        }
        if self.graded_class.is_empty() {
            return Err(GradeError::Config("graded_class must not be empty".to_string()));
        }
        if self.last_value_aliases.is_empty() {
            return Err(GradeError::Config(
                "at least one last value alias is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for alias in &self.last_value_aliases {
            if !name_re.is_match(alias) {
                return Err(GradeError::Config(format!("invalid binding name '{}'", alias)));
            }
            if FIXED_BINDINGS.contains(&alias.as_str()) {
                return Err(GradeError::Config(format!(
                    "alias '{}' collides with a reserved binding",
                    alias
                )));
            }
            if !seen.insert(alias.as_str()) {
                return Err(GradeError::Config(format!("duplicate alias '{}'", alias)));
            }
        }

        if !name_re.is_match(&self.check_function) {
            return Err(GradeError::Config(format!(
                "invalid binding name '{}'",
                self.check_function
            )));
        }
        if seen.contains(self.check_function.as_str())
            || FIXED_BINDINGS.contains(&self.check_function.as_str())
        {
            return Err(GradeError::Config(format!(
                "check function name '{}' collides with a context binding",
                self.check_function
            )));
        }

        let labels = &self.labels;
        for label in [&labels.prep, &labels.result, &labels.grading] {
            if !label_re.is_match(label) {
                return Err(GradeError::Config(format!("invalid scope label '{}'", label)));
            }
        }
        if labels.grading == labels.result || labels.grading == labels.prep {
            return Err(GradeError::Config(
                "grading scope label must differ from the prep and result labels".to_string(),
            ));
        }

        Ok(())
    }
}
