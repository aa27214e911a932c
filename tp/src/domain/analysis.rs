//! Codebase analysis types
//!
//! An analysis asks the agent, read-only, how far along each subject (usually a
//! task title) is in a project. Every requested subject always gets exactly one
//! [`AnalysisRecord`].

use serde::{Deserialize, Serialize};

/// Something to assess in the codebase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSubject {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AnalysisSubject {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Implementation progress of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Complete,
    Partial,
    NotStarted,
    Unknown,
}

impl AnalysisStatus {
    /// Lenient parse; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "complete" => Self::Complete,
            "partial" => Self::Partial,
            "not_started" => Self::NotStarted,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::NotStarted => write!(f, "not_started"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// How sure the agent is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Lenient parse; anything unrecognized is `Low`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Verdict for one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub subject_title: String,
    pub status: AnalysisStatus,
    pub confidence: Confidence,
    pub evidence: String,
}

impl AnalysisRecord {
    /// Low-confidence unknown verdict with a human-readable reason
    pub fn unknown(subject_title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject_title: subject_title.into(),
            status: AnalysisStatus::Unknown,
            confidence: Confidence::Low,
            evidence: reason.into(),
        }
    }
}
