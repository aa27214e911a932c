//! Read-only codebase analysis
//!
//! Asks the agent how far each subject has progressed in a project and turns
//! its free-form answer into exactly one [`AnalysisRecord`] per subject. A
//! timeout, failed exit or unparsable answer still yields a full set of
//! records, each an unknown verdict explaining what went wrong.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{AnalysisRecord, AnalysisStatus, AnalysisSubject, Confidence};
use crate::runner::{AgentInvocation, discard_sink};

use super::{Orchestrator, exit_label};

const NOT_ANALYZED: &str = "Not analyzed";

/// What to analyze and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub project_path: PathBuf,
    pub subjects: Vec<AnalysisSubject>,
    /// Agent model; the configured default when None
    pub model: Option<String>,
    /// Hard deadline; the configured analysis timeout when None
    pub timeout: Option<Duration>,
}

impl AnalysisRequest {
    pub fn new(project_path: impl Into<PathBuf>, subjects: Vec<AnalysisSubject>) -> Self {
        Self {
            project_path: project_path.into(),
            subjects,
            model: None,
            timeout: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Orchestrator {
    /// Analyze `request.subjects`, returning one record per subject in request order
    pub async fn analyze(&self, request: AnalysisRequest) -> Vec<AnalysisRecord> {
        debug!(
            project_path = %request.project_path.display(),
            subject_count = request.subjects.len(),
            "analyze: called"
        );
        if request.subjects.is_empty() {
            return Vec::new();
        }

        let instruction = match self.prompts.analysis_prompt(&request.subjects) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "analyze: failed to build instruction");
                return fallback(&request.subjects, &format!("Could not build analysis instruction: {}", e));
            }
        };

        let timeout = request.timeout.unwrap_or_else(|| self.config.analysis.timeout());
        let invocation = AgentInvocation::for_analysis(
            &self.config.agent,
            instruction,
            &request.project_path,
            request.model.as_deref(),
            timeout,
        );
        let result = self.executor.run(&invocation, None, discard_sink()).await;

        if let Some(err) = result.spawn_error.as_deref() {
            warn!(error = %err, "Analysis agent failed to start");
            return fallback(&request.subjects, &format!("Analysis agent failed to start: {}", err));
        }
        if result.timed_out {
            warn!(timeout = ?timeout, "Analysis timed out");
            return fallback(
                &request.subjects,
                &format!("Analysis timed out after {}", format_duration(timeout)),
            );
        }
        if !result.succeeded() {
            warn!(exit_code = ?result.exit_code, "Analysis process failed");
            let reason = match result.exit_code {
                Some(code) => format!("Analysis process exited with code {}", code),
                None => format!("Analysis process failed ({})", exit_label(None)),
            };
            return fallback(&request.subjects, &reason);
        }

        match parse_analysis_output(&result.output) {
            Some(results) => {
                let records = reconcile(&request.subjects, &results);
                info!(
                    subject_count = records.len(),
                    analyzed = records.iter().filter(|r| r.evidence != NOT_ANALYZED).count(),
                    "Analysis complete"
                );
                records
            }
            None => {
                warn!(output_len = result.output.len(), "Could not parse analysis output");
                fallback(&request.subjects, "Could not parse analysis output")
            }
        }
    }
}

fn fallback(subjects: &[AnalysisSubject], reason: &str) -> Vec<AnalysisRecord> {
    subjects
        .iter()
        .map(|s| AnalysisRecord::unknown(&s.title, reason))
        .collect()
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Find the first JSON object with a `results` array in free-form output
///
/// Leading and trailing prose are skipped; every `{` is tried as the start of
/// an object until one parses and carries `results`.
pub fn parse_analysis_output(output: &str) -> Option<Vec<Value>> {
    for (start, _) in output.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(mut object))) = stream.next() {
            if let Some(Value::Array(results)) = object.remove("results") {
                return Some(results);
            }
        }
    }
    None
}

fn subject_key(title: &str) -> String {
    title.trim().to_lowercase()
}

fn record_from_value(value: &Value) -> Option<AnalysisRecord> {
    let text = |key: &str| value.get(key).and_then(Value::as_str);
    let title = text("subjectTitle")?;
    Some(AnalysisRecord {
        subject_title: title.to_string(),
        status: text("status").map_or(AnalysisStatus::Unknown, AnalysisStatus::parse),
        confidence: text("confidence").map_or(Confidence::Low, Confidence::parse),
        evidence: text("evidence").unwrap_or_default().to_string(),
    })
}

/// Match parsed results to the requested subjects
///
/// Titles match case-insensitively after trimming; the first result for a
/// title wins and results for unrequested titles are dropped. Subjects with
/// no result get an unknown verdict. Output follows request order and uses
/// the requested titles verbatim.
pub fn reconcile(subjects: &[AnalysisSubject], results: &[Value]) -> Vec<AnalysisRecord> {
    let mut by_title: HashMap<String, AnalysisRecord> = HashMap::new();
    for record in results.iter().filter_map(record_from_value) {
        by_title.entry(subject_key(&record.subject_title)).or_insert(record);
    }

    subjects
        .iter()
        .map(|subject| match by_title.get(&subject_key(&subject.title)) {
            Some(record) => AnalysisRecord {
                subject_title: subject.title.clone(),
                ..record.clone()
            },
            None => AnalysisRecord::unknown(&subject.title, NOT_ANALYZED),
        })
        .collect()
}
