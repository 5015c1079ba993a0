//! Prompt rendering for agent processes.

use fuel_core::{ProcessType, Task};
use std::fmt::Write;
use std::path::Path;

/// Renders the prompt handed to an agent.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, task: &Task, process_type: ProcessType, cwd: &Path) -> String;
}

/// Plain-text prompts assembled from the task's fields.
#[derive(Debug, Default, Clone)]
pub struct TemplatePromptBuilder;

impl TemplatePromptBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, task: &Task, process_type: ProcessType, cwd: &Path) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Task {}: {}", task.id, task.title);
        let _ = writeln!(prompt, "Working directory: {}", cwd.display());
        if let Some(description) = &task.description {
            let _ = writeln!(prompt, "\n{description}");
        }

        prompt.push('\n');
        match process_type {
            ProcessType::Task => {
                let _ = writeln!(
                    prompt,
                    "Complete the task. When finished, commit your work and exit with status 0."
                );
            }
            ProcessType::Review => {
                let _ = writeln!(
                    prompt,
                    "Review the work done for this task. Print exactly one JSON line \
                     {{\"review\": \"pass\"}} or {{\"review\": \"fail\", \"issues\": [\"...\"]}}."
                );
            }
            ProcessType::SelfGuided => {
                let _ = writeln!(
                    prompt,
                    "This is iteration {} of a self-guided task. Make the next increment of \
                     progress. Close the task yourself once the goal is fully met.",
                    task.selfguided_iteration + 1
                );
            }
            ProcessType::EpicMerge => {
                let epic = task.epic_id.as_ref().map(|e| e.as_str()).unwrap_or("unknown");
                let _ = writeln!(
                    prompt,
                    "Merge the mirror workspace of epic {epic} into the main branch and resolve \
                     any conflicts."
                );
            }
            ProcessType::RealityIndex => {
                let _ = writeln!(
                    prompt,
                    "Update the project's reality index to reflect the current state of the code."
                );
            }
        }
        if let Some(reason) = &task.reason {
            let _ = writeln!(prompt, "\nNote from the previous attempt: {reason}");
        }
        prompt
    }
}
