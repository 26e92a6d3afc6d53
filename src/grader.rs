// src/grader.rs
use std::time::Instant;
use uuid::Uuid;

use crate::config::{
    ENGINE_BINDING, ENVIR_PREP_BINDING, ENVIR_RESULT_BINDING, EVALUATE_RESULT_BINDING,
    EvaluateOptions, GraderConfig, GradingSpec, LABEL_BINDING, USER_CODE_BINDING,
};
use crate::errors::{GradeError, Result};
use crate::models::{Feedback, PassReport};
use crate::sandbox::{Binding, EnvironmentManager, Evaluator};

/// Grades one exercise against the user's most recent run.
pub struct Grader<E: Evaluator> {
    pub(crate) evaluator: E,
    pub(crate) spec: GradingSpec,
    pub(crate) config: GraderConfig,
    pub(crate) options: EvaluateOptions,
}

impl<E: Evaluator> Grader<E> {
    pub fn new(evaluator: E, spec: GradingSpec, config: GraderConfig) -> Result<Self> {
        config.validate()?;
        let options = EvaluateOptions::grading(config.labels.grading.clone(), config.timelimit());
        Ok(Self {
            evaluator,
            spec,
            config,
            options,
        })
    }

    /// The fixed options every grading evaluation runs under.
    pub fn options(&self) -> &EvaluateOptions {
        &self.options
    }

    /// Creates a fresh grading scope and binds the grading context into it.
    ///
    /// Must run once per pass, before [`Grader::check`]. Any failed bind aborts
    /// the pass instead of leaving a partially populated scope in use.
    pub async fn setup_grading(&self) -> Result<()> {
        self.bind_context().await.map(|_| ())
    }

    async fn bind_context(&self) -> Result<String> {
        let labels = &self.config.labels;
        let environments = self.evaluator.environments();

        environments.create(&labels.grading, &labels.result).await?;

        let envir_prep = environments.get(&labels.prep).await?;
        let envir_result = environments.get(&labels.result).await?;
        let last_run = self
            .evaluator
            .last_run()
            .await
            .ok_or(GradeError::NoPriorRun)?;

        let mut bindings = vec![
            (ENGINE_BINDING, Binding::Text(self.config.engine.clone())),
            (LABEL_BINDING, Binding::Text(last_run.exercise.clone())),
            (USER_CODE_BINDING, Binding::Text(last_run.user_code.clone())),
        ];
        for alias in &self.config.last_value_aliases {
            bindings.push((alias.as_str(), Binding::Value(last_run.value.clone())));
        }
        bindings.push((ENVIR_PREP_BINDING, Binding::Scope(envir_prep)));
        bindings.push((ENVIR_RESULT_BINDING, Binding::Scope(envir_result)));
        bindings.push((EVALUATE_RESULT_BINDING, Binding::Value(last_run.evaluate_result)));

        let count = bindings.len();
        for (name, binding) in bindings {
            self.evaluator
                .bind(name, binding, &labels.grading)
                .await
                .inspect_err(|e| log::error!("Binding '{}' into grading scope failed: {}", name, e))?;
        }

        log::debug!(
            "Grading scope '{}' ready for '{}' with {} bindings",
            labels.grading,
            last_run.exercise,
            count
        );
        Ok(last_run.exercise)
    }

    /// Runs a complete grading pass: setup, then check.
    pub async fn run_pass(&self) -> Result<(Option<Feedback<E::Value>>, PassReport)> {
        let pass_id = Uuid::new_v4();
        let started_at = chrono::Utc::now().to_rfc3339();
        let start = Instant::now();

        log::info!("Starting grading pass {}", pass_id);

        let exercise = self
            .bind_context()
            .await
            .inspect_err(|e| log::error!("Grading pass {} failed during setup: {}", pass_id, e))?;
        let feedback = self
            .check()
            .await
            .inspect_err(|e| log::error!("Grading pass {} failed during check: {}", pass_id, e))?;

        let (outcome, style) = PassReport::outcome_of(feedback.as_ref());
        let report = PassReport {
            pass_id,
            exercise,
            started_at,
            latency_ms: start.elapsed().as_millis() as u64,
            outcome,
            style,
        };

        log::info!(
            "Grading pass {} for '{}' finished in {}ms with outcome {:?}",
            report.pass_id,
            report.exercise,
            report.latency_ms,
            report.outcome
        );
        Ok((feedback, report))
    }
}
