// src/models.rs
use serde::Serialize;
use uuid::Uuid;

use crate::feedback::{FeedbackElement, FeedbackStyle};
use crate::sandbox::Container;

/// Visible outcome of a check that produced something to show.
#[derive(Debug, Clone)]
pub enum Feedback<V> {
    /// A structured grade rendered as an alert.
    Element(FeedbackElement),
    /// Anything else the checking logic returned, as materialized by the
    /// evaluator.
    Raw(Container<V>),
}

impl<V> Feedback<V> {
    pub fn as_element(&self) -> Option<&FeedbackElement> {
        match self {
            Feedback::Element(element) => Some(element),
            Feedback::Raw(_) => None,
        }
    }

    /// Markup the host can insert into the document.
    pub fn to_html(&self) -> String {
        match self {
            Feedback::Element(element) => element.to_html(),
            Feedback::Raw(container) => container.markup.clone(),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PassOutcome {
    None,
    Raw,
    Feedback,
}

/// Summary of one grading pass, suitable for logging or handing to the host.
#[derive(Debug, Serialize, Clone)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub exercise: String,
    pub started_at: String,
    pub latency_ms: u64,
    pub outcome: PassOutcome,
    pub style: Option<FeedbackStyle>,
}

impl PassReport {
    pub(crate) fn outcome_of<V>(feedback: Option<&Feedback<V>>) -> (PassOutcome, Option<FeedbackStyle>) {
        match feedback {
            None => (PassOutcome::None, None),
            Some(Feedback::Raw(_)) => (PassOutcome::Raw, None),
            Some(Feedback::Element(element)) => (PassOutcome::Feedback, Some(element.style)),
        }
    }
}
