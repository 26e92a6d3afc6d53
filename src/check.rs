// src/check.rs
use crate::errors::Result;
use crate::feedback::feedback_as_html;
use crate::grader::Grader;
use crate::models::Feedback;
use crate::sandbox::{
    Binding, Container, EnvironmentManager, Evaluator, SandboxValue, Shelter, ShelterGuard,
    ValueKind,
};

/// How the checking logic is run, decided once from what `check` evaluates to.
enum CheckDispatch<S> {
    /// `check` is a function of the grading environment.
    Callable(S),
    /// `check` is an expression evaluated in the grading scope.
    Expression,
}

/// A materialized check result, either a grade or something to show as is.
enum Decoded<V> {
    Graded(V),
    Raw(Container<V>),
}

impl<E: Evaluator> Grader<E> {
    /// Runs the checking logic against the grading scope.
    ///
    /// Returns `None` when the check produced the sandbox's null value. Every
    /// sandbox value created along the way is released before this returns,
    /// whichever way it returns.
    pub async fn check(&self) -> Result<Option<Feedback<E::Value>>> {
        let code = self.spec.check_code()?;
        let shelter = ShelterGuard::new(self.evaluator.shelter().await?);
        self.check_sheltered(&shelter, code).await
    }

    async fn check_sheltered(
        &self,
        shelter: &ShelterGuard<E::Shelter>,
        code: &str,
    ) -> Result<Option<Feedback<E::Value>>> {
        let label = &self.config.labels.grading;
        let grading = self.evaluator.environments().get(label).await?;

        let candidate = shelter.evaluate(code, &grading, &self.options).await?;
        let dispatch = match candidate.kind().await? {
            ValueKind::Callable => {
                self.evaluator
                    .bind(&self.config.check_function, Binding::Value(candidate.clone()), label)
                    .await?;
                CheckDispatch::Callable(grading)
            }
            ValueKind::Null | ValueKind::Other => CheckDispatch::Expression,
        };

        let capture = match dispatch {
            CheckDispatch::Callable(env) => {
                log::debug!("Invoking check function as '{}'", self.config.check_function);
                self.evaluator.invoke(&candidate, &env, label, &self.options).await?
            }
            CheckDispatch::Expression => {
                self.evaluator.evaluate(code, label, &self.options).await?
            }
        };

        if capture.kind().await? == ValueKind::Null {
            log::debug!("Check returned NULL, no feedback to show");
            return Ok(None);
        }

        let container = self.evaluator.as_html(&capture, &self.options).await?;
        match self.decode(container).await? {
            Decoded::Graded(grade) => Ok(Some(Feedback::Element(feedback_as_html(&grade).await?))),
            Decoded::Raw(container) => Ok(Some(Feedback::Raw(container))),
        }
    }

    async fn decode(&self, container: Container<E::Value>) -> Result<Decoded<E::Value>> {
        let classes = container.result.classes().await?;
        if classes.iter().any(|class| *class == self.config.graded_class) {
            Ok(Decoded::Graded(container.result))
        } else {
            Ok(Decoded::Raw(container))
        }
    }
}
