// src/feedback.rs
use serde::Serialize;
use std::fmt;

use crate::errors::{GradeError, Result};
use crate::sandbox::{SandboxValue, ValueKind};

/// The `type` a grade declares, matched case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradeType {
    Success,
    Info,
    Warning,
    Error,
    Danger,
    Unspecified(Option<String>),
}

impl GradeType {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("success") => GradeType::Success,
            Some("info") => GradeType::Info,
            Some("warning") => GradeType::Warning,
            Some("error") => GradeType::Error,
            Some("danger") => GradeType::Danger,
            other => GradeType::Unspecified(other.map(str::to_string)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStyle {
    Success,
    Info,
    Warning,
    Danger,
}

impl FeedbackStyle {
    pub fn css_class(&self) -> &'static str {
        match self {
            FeedbackStyle::Success => "alert-success",
            FeedbackStyle::Info => "alert-info",
            FeedbackStyle::Warning => "alert-warning",
            FeedbackStyle::Danger => "alert-danger",
        }
    }
}

impl fmt::Display for FeedbackStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackStyle::Success => write!(f, "success"),
            FeedbackStyle::Info => write!(f, "info"),
            FeedbackStyle::Warning => write!(f, "warning"),
            FeedbackStyle::Danger => write!(f, "danger"),
        }
    }
}

/// A structured grade decoded from the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Grade {
    pub kind: GradeType,
    /// Only read when `kind` is unspecified.
    pub correct: Option<bool>,
    pub message: String,
}

impl Grade {
    /// Reads `type`, `correct` and `message` off a graded sandbox value, in
    /// that order.
    pub async fn read<V: SandboxValue>(value: &V) -> Result<Self> {
        let kind = match value.get("type").await? {
            Some(raw) => {
                if raw.kind().await? == ValueKind::Null {
                    GradeType::Unspecified(None)
                } else {
                    GradeType::parse(Some(&raw.to_text().await?))
                }
            }
            None => GradeType::Unspecified(None),
        };

        // `correct` is only converted when the type does not decide the style.
        let correct = match (value.get("correct").await?, &kind) {
            (Some(raw), GradeType::Unspecified(_)) => Some(raw.to_bool().await?),
            _ => None,
        };

        let message = value
            .get("message")
            .await?
            .ok_or_else(|| GradeError::Conversion("grade has no `message`".to_string()))?
            .to_text()
            .await?;

        Ok(Grade {
            kind,
            correct,
            message,
        })
    }

    pub fn style(&self) -> Result<FeedbackStyle> {
        match self.kind {
            GradeType::Success => Ok(FeedbackStyle::Success),
            GradeType::Info => Ok(FeedbackStyle::Info),
            GradeType::Warning => Ok(FeedbackStyle::Warning),
            GradeType::Error | GradeType::Danger => Ok(FeedbackStyle::Danger),
            GradeType::Unspecified(_) => match self.correct {
                Some(true) => Ok(FeedbackStyle::Success),
                Some(false) => Ok(FeedbackStyle::Danger),
                None => Err(GradeError::Conversion(
                    "grade has neither a known `type` nor a `correct` flag".to_string(),
                )),
            },
        }
    }

    pub fn to_element(&self) -> Result<FeedbackElement> {
        Ok(FeedbackElement::new(self.style()?, self.message.clone()))
    }
}

/// A styled alert holding one text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackElement {
    pub role: &'static str,
    pub style: FeedbackStyle,
    pub message: String,
}

impl FeedbackElement {
    pub fn new(style: FeedbackStyle, message: impl Into<String>) -> Self {
        Self {
            role: "alert",
            style,
            message: message.into(),
        }
    }

    pub fn to_html(&self) -> String {
        format!(
            r#"<div class="{role} {class}" role="{role}"><span>{message}</span></div>"#,
            role = self.role,
            class = self.style.css_class(),
            message = escape_html(&self.message),
        )
    }
}

/// Maps a graded sandbox value to a feedback element.
pub async fn feedback_as_html<V: SandboxValue>(grade: &V) -> Result<FeedbackElement> {
    let grade = Grade::read(grade).await?;
    let element = grade.to_element()?;
    log::debug!("Grade {:?} rendered as {} feedback", grade.kind, element.style);
    Ok(element)
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
