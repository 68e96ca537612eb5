//! Prompt-tuning tables.
//!
//! A prompt-tuned model carries one learned embedding table per task. The
//! engine wants them stacked into one `[num_tasks, max_vtokens, hidden]`
//! tensor, with shorter tables zero-padded.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::tensor::{stack, HostTensor};
use crate::{Error, Result};

/// One task of a prompt-tuning config.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplate {
    pub taskname: String,
}

/// Prompt-tuning config; only the task list matters for conversion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub task_templates: Option<Vec<TaskTemplate>>,
}

impl PromptConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Learned prompt embeddings.
#[derive(Debug, Clone, Default)]
pub struct PromptWeights {
    /// Per-task tables keyed `prompt_table.{task}.prompt_embeddings.weight`
    pub prompt_table: HashMap<String, HostTensor>,
    /// Single pre-combined table, used when the config has no tasks
    pub prompt_embeddings_weights: Option<HostTensor>,
}

/// Key of a task's table in [`PromptWeights::prompt_table`].
#[must_use]
pub fn task_table_key(task_name: &str) -> String {
    format!("prompt_table.{task_name}.prompt_embeddings.weight")
}

/// Build the engine prompt table.
///
/// With `task_templates`, every task that has a table contributes one slice
/// (tasks without a table are skipped); tables are zero-padded to the
/// longest one and stacked. Without tasks the combined
/// `prompt_embeddings_weights` tensor is returned unchanged.
///
/// # Errors
/// Returns an error if no task has a table, tables are not 2-D or differ in
/// hidden size or dtype, or the combined tensor is missing.
pub fn prompt_convert(config: &PromptConfig, weights: &PromptWeights) -> Result<HostTensor> {
    let Some(templates) = &config.task_templates else {
        return weights.prompt_embeddings_weights.clone().ok_or_else(|| {
            Error::PromptTable("no task_templates and no prompt_embeddings_weights".into())
        });
    };

    let mut tables: Vec<&HostTensor> = Vec::new();
    for template in templates {
        let Some(table) = weights.prompt_table.get(&task_table_key(&template.taskname)) else {
            continue;
        };
        if table.ndim() != 2 {
            return Err(Error::PromptTable(format!(
                "task {} table must be 2-D, got shape {:?}",
                template.taskname, table.shape
            )));
        }
        tracing::info!(
            task_id = tables.len(),
            task = %template.taskname,
            vtokens = table.shape[0],
            "collected prompt task"
        );
        tables.push(table);
    }

    let first = tables
        .first()
        .ok_or_else(|| Error::PromptTable("no task has a prompt table".into()))?;
    let max_vtokens = tables.iter().map(|t| t.shape[0]).max().unwrap_or(0);

    let padded = tables
        .iter()
        .map(|t| {
            if t.shape[1] != first.shape[1] {
                return Err(Error::ShapeMismatch {
                    expected: vec![t.shape[0], first.shape[1]],
                    got: t.shape.clone(),
                });
            }
            t.pad_rows(max_vtokens)
        })
        .collect::<Result<Vec<_>>>()?;

    stack(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: usize, hidden: usize, fill: f32) -> HostTensor {
        HostTensor::from_f32(vec![rows, hidden], &vec![fill; rows * hidden]).unwrap()
    }

    fn config(tasks: &[&str]) -> PromptConfig {
        PromptConfig {
            task_templates: Some(
                tasks
                    .iter()
                    .map(|t| TaskTemplate {
                        taskname: (*t).to_string(),
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_tasks_padded_and_stacked() {
        let mut weights = PromptWeights::default();
        weights
            .prompt_table
            .insert(task_table_key("squad"), table(1, 2, 1.0));
        weights
            .prompt_table
            .insert(task_table_key("sentiment"), table(3, 2, 2.0));

        let out = prompt_convert(&config(&["squad", "missing", "sentiment"]), &weights).unwrap();
        assert_eq!(out.shape, vec![2, 3, 2]);
        assert_eq!(
            out.to_f32_vec(),
            vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_combined_weights_pass_through() {
        let combined = table(4, 2, 5.0);
        let weights = PromptWeights {
            prompt_embeddings_weights: Some(combined.clone()),
            ..PromptWeights::default()
        };
        let out = prompt_convert(&PromptConfig::default(), &weights).unwrap();
        assert_eq!(out, combined);
    }

    #[test]
    fn test_errors() {
        let weights = PromptWeights::default();
        assert!(prompt_convert(&PromptConfig::default(), &weights).is_err());
        assert!(prompt_convert(&config(&["a"]), &weights).is_err());

        let mut mismatched = PromptWeights::default();
        mismatched.prompt_table.insert(task_table_key("a"), table(1, 2, 0.0));
        mismatched.prompt_table.insert(task_table_key("b"), table(1, 3, 0.0));
        assert!(matches!(
            prompt_convert(&config(&["a", "b"]), &mismatched),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_config_parses_task_templates() {
        let cfg: PromptConfig = serde_json::from_str(
            r#"{"task_templates": [{"taskname": "squad", "prompt_template": "<|VIRTUAL_PROMPT_0|>"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.task_templates.unwrap()[0].taskname, "squad");
    }
}
