//! Prompt Loader
//!
//! Loads prompt templates from a user override directory or falls back to the
//! embedded defaults, then renders them with Handlebars.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::domain::{AnalysisSubject, Task};

use super::embedded;

/// Context for the task and iteration templates
#[derive(Debug, Clone, Serialize)]
pub struct TaskPromptContext {
    pub title: String,
    pub description: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_token: String,
}

impl TaskPromptContext {
    /// Context for a single-shot run
    pub fn for_task(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone().filter(|d| !d.trim().is_empty()),
            iteration: 0,
            max_iterations: 0,
            completion_token: task.ralph.token().to_string(),
        }
    }

    /// Context for one loop iteration, built from the freshest snapshot
    pub fn for_iteration(task: &Task, iteration: u32, max_iterations: u32) -> Self {
        Self {
            iteration,
            max_iterations,
            ..Self::for_task(task)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnalysisPromptContext<'a> {
    subjects: &'a [AnalysisSubject],
}

/// Loads and renders prompt templates
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    /// User override directory (e.g., `.taskpilot/prompts/`)
    user_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader that honours `<root>/.taskpilot/prompts/{name}.pmt`
    pub fn new(root: impl AsRef<Path>) -> Self {
        let user_dir = root.as_ref().join(".taskpilot").join("prompts");
        let user_dir_exists = user_dir.is_dir();
        debug!(?user_dir, %user_dir_exists, "PromptLoader::new: called");

        Self {
            hbs: Self::engine(),
            user_dir: user_dir_exists.then_some(user_dir),
        }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        debug!("PromptLoader::embedded_only: called");
        Self {
            hbs: Self::engine(),
            user_dir: None,
        }
    }

    fn engine() -> Handlebars<'static> {
        let mut hbs = Handlebars::new();
        // Prompts are plain text, not HTML
        hbs.register_escape_fn(handlebars::no_escape);
        hbs
    }

    /// Load a template by name: user override first, then embedded
    fn load_template(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load_template: called");
        if let Some(ref user_dir) = self.user_dir {
            let path = user_dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found in user override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read user prompt {}: {}", path.display(), e));
            }
        }

        embedded::get_embedded(name)
            .map(str::to_string)
            .ok_or_else(|| eyre!("Prompt template not found: {}", name))
    }

    fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        let template = self.load_template(name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", name, e))
    }

    /// Instruction for a single-shot run
    pub fn task_prompt(&self, task: &Task) -> Result<String> {
        debug!(task_id = %task.id, "PromptLoader::task_prompt: called");
        self.render("task", &TaskPromptContext::for_task(task))
    }

    /// Instruction for one loop iteration
    pub fn iteration_prompt(&self, task: &Task, iteration: u32, max_iterations: u32) -> Result<String> {
        debug!(task_id = %task.id, iteration, max_iterations, "PromptLoader::iteration_prompt: called");
        self.render(
            "iteration",
            &TaskPromptContext::for_iteration(task, iteration, max_iterations),
        )
    }

    /// Instruction for a read-only codebase analysis
    pub fn analysis_prompt(&self, subjects: &[AnalysisSubject]) -> Result<String> {
        debug!(subject_count = subjects.len(), "PromptLoader::analysis_prompt: called");
        self.render("analysis", &AnalysisPromptContext { subjects })
    }
}

impl Default for PromptLoader {
    fn default() -> Self {
        Self::embedded_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_task_prompt_includes_title_and_description() {
        let loader = PromptLoader::embedded_only();
        let task = Task::new("Add logout button").with_description("Put it in the <nav> & header");

        let prompt = loader.task_prompt(&task).unwrap();
        assert!(prompt.contains("# Task: Add logout button"));
        // Not HTML-escaped
        assert!(prompt.contains("Put it in the <nav> & header"));
        assert!(!prompt.contains("<promise>"));
    }

    #[test]
    fn test_task_prompt_without_description() {
        let loader = PromptLoader::embedded_only();
        let prompt = loader.task_prompt(&Task::new("Bare")).unwrap();
        assert!(prompt.contains("# Task: Bare"));
    }

    #[test]
    fn test_iteration_prompt_embeds_counts_and_token() {
        let loader = PromptLoader::embedded_only();
        let task = Task::new("Loop me").with_ralph(3, "DONE");

        let prompt = loader.iteration_prompt(&task, 2, 3).unwrap();
        assert!(prompt.contains("iteration 2 of at most 3"));
        assert!(prompt.contains("<promise>DONE</promise>"));
    }

    #[test]
    fn test_iteration_prompt_blank_token_uses_default() {
        let loader = PromptLoader::embedded_only();
        let task = Task::new("Loop me").with_ralph(3, "  ");

        let prompt = loader.iteration_prompt(&task, 1, 3).unwrap();
        assert!(prompt.contains("<promise>TASK_COMPLETE</promise>"));
    }

    #[test]
    fn test_analysis_prompt_lists_subjects() {
        let loader = PromptLoader::embedded_only();
        let subjects = vec![
            AnalysisSubject::new("Login page").with_description("email + password"),
            AnalysisSubject::new("Dark mode"),
        ];

        let prompt = loader.analysis_prompt(&subjects).unwrap();
        assert!(prompt.contains("- Login page: email + password"));
        assert!(prompt.contains("- Dark mode"));
        assert!(prompt.contains("\"results\""));
    }

    #[test]
    fn test_user_override_wins() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join(".taskpilot").join("prompts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("task.pmt"), "custom {{title}}").unwrap();

        let loader = PromptLoader::new(temp.path());
        let prompt = loader.task_prompt(&Task::new("X")).unwrap();
        assert_eq!(prompt, "custom X");

        // Other templates still fall back to embedded
        assert!(loader.iteration_prompt(&Task::new("X"), 1, 1).unwrap().contains("<promise>"));
    }

    #[test]
    fn test_unknown_template() {
        let loader = PromptLoader::embedded_only();
        assert!(loader.load_template("nonexistent-template").is_err());
    }
}
