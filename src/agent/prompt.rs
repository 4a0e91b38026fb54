//! Request construction and response cleanup.
//!
//! One request combines the user's prompt with the serialized units of a
//! single batch. Round-0 batches carry raw records and ask for the full
//! analysis; later batches carry partial analyses and ask for a merge.

use crate::models::{Batch, UnitKind};

/// Output instructions for batches of raw records.
pub const OUTPUT_PROMPT: &str = "Present an overview of the projects. Then provide an in-depth analysis for each of the top projects. Make sure to include the name, twitter handle, and market cap of each top project. Explain why each top project is interesting to investors and how it compares to other projects.\n\nLimit your analysis to at most 5 top projects. Provide a confidence level for each of your assessments and a brief summary of what additional contextual information would be required to make a more confident assessment.";

/// Output instructions for batches of earlier results.
pub const CONSOLIDATE_PROMPT: &str = "Each item below is an analysis of a different, disjoint part of the same dataset. Combine them into a single analysis that follows the purpose above, as if the whole dataset had been analyzed at once. Keep the strongest findings from every item and drop duplicates. Items marked as failed batches contain no data; mention the gap instead of guessing what it held.";

const FORMAT_RULES: &str = "- Use markdown to format the output.\n- Structure the output using headings and subheadings.";

/// Builds the request text for a batch.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    prompt: String,
    output_prompt: String,
    data_note: Option<String>,
    context: Option<String>,
}

impl RequestTemplate {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            output_prompt: OUTPUT_PROMPT.to_string(),
            data_note: None,
            context: None,
        }
    }

    /// Replace the output instructions used for raw-record batches.
    pub fn with_output_prompt(mut self, output_prompt: impl Into<String>) -> Self {
        self.output_prompt = output_prompt.into();
        self
    }

    /// Sentence describing where the data came from, placed in the purpose block.
    pub fn with_data_note(mut self, note: impl Into<String>) -> Self {
        self.data_note = Some(note.into());
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Render the full request text for one batch.
    pub fn render(&self, batch: &Batch) -> String {
        let mut out = String::new();

        out.push_str("<purpose>\n");
        if batch.is_records() {
            out.push_str("Analyze the items stated below based on the provided data.\n");
        } else {
            out.push_str("Consolidate the partial analyses stated below.\n");
        }
        if let Some(ref note) = self.data_note {
            out.push_str(note);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(self.prompt.trim());
        out.push_str("\n</purpose>\n\n");

        out.push_str("<format_rules>\n");
        out.push_str(FORMAT_RULES);
        out.push_str("\n</format_rules>\n\n");

        out.push_str("<output>\n");
        if batch.is_records() {
            out.push_str(&self.output_prompt);
        } else {
            out.push_str(CONSOLIDATE_PROMPT);
        }
        out.push_str("\n</output>\n\n--\n\n<data>\n");

        for unit in batch.units() {
            let kind = match unit.kind() {
                UnitKind::Record => "record",
                UnitKind::Outcome => "analysis",
                UnitKind::Placeholder => "failed-batch",
            };
            out.push_str(&format!(
                "<item id=\"{}\" kind=\"{}\">\n{}\n</item>\n",
                unit.id(),
                kind,
                unit.text().trim_end()
            ));
        }
        out.push_str("</data>");

        if let Some(ref context) = self.context {
            out.push_str("\n\n<context>\n");
            out.push_str(context.trim());
            out.push_str("\n</context>");
        }

        out
    }
}

/// Strip reasoning blocks and a wrapping code fence from a model response.
pub fn clean_response(raw: &str) -> String {
    let mut text = raw.trim();

    if text.contains("<think>") {
        if let Some(end) = text.find("</think>") {
            text = text[end + "</think>".len()..].trim_start();
        }
    }

    let text = text.trim();
    if text.len() >= 6 && text.starts_with("```") && text.ends_with("```") {
        let inner = match text.find('\n') {
            Some(newline) if newline < text.len() - 3 => &text[newline + 1..text.len() - 3],
            _ => "",
        };
        return inner.trim().to_string();
    }

    text.to_string()
}
