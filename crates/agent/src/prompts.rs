//! Prompt construction. Templates are embedded at compile time and
//! rendered with `tera`; a render failure is a configuration problem
//! reported to the caller, never a panic mid-turn.

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use parley_core::experiments::PromptStyle;
use parley_core::reflection::StylePolicy;
use parley_core::retrieval::RetrievalResult;
use parley_core::tools::ToolCall;

const GENERATION_TEMPLATE: &str = "generation.txt";
const CONFIRMATION_TEMPLATE: &str = "confirmation.txt";

/// Sent as the system message on every completion.
pub const SYSTEM_PROMPT: &str = "You are Parley, a careful assistant for a team's internal \
records. You answer from the provided sources and you never run a destructive change without \
an explicit confirmation.";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template error: {0}")]
    Template(String),
    #[error("render error in `{template}`: {detail}")]
    Render { template: String, detail: String },
}

/// Everything one generation prompt depends on.
#[derive(Clone, Debug)]
pub struct GenerationPrompt<'a> {
    pub question: &'a str,
    pub context: &'a [RetrievalResult],
    pub style: PromptStyle,
    /// Violation details from a rejected draft, fed back verbatim.
    pub critique: &'a [String],
    /// Tightens the grounding instructions after an unsupported claim.
    pub strict_grounding: bool,
}

#[derive(Serialize)]
struct PromptSource<'a> {
    source_id: &'a str,
    excerpt: &'a str,
}

#[derive(Clone)]
pub struct PromptRenderer {
    tera: Tera,
    max_answer_chars: usize,
}

impl PromptRenderer {
    pub fn new(policy: &StylePolicy) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_template(
            GENERATION_TEMPLATE,
            include_str!("../../../templates/prompts/generation.txt.tera"),
        )
        .map_err(|error| PromptError::Template(error.to_string()))?;
        tera.add_raw_template(
            CONFIRMATION_TEMPLATE,
            include_str!("../../../templates/prompts/confirmation.txt.tera"),
        )
        .map_err(|error| PromptError::Template(error.to_string()))?;

        Ok(Self { tera, max_answer_chars: policy.max_answer_chars })
    }

    pub fn generation_prompt(&self, prompt: &GenerationPrompt<'_>) -> Result<String, PromptError> {
        let sources: Vec<PromptSource<'_>> = prompt
            .context
            .iter()
            .map(|result| PromptSource {
                source_id: &result.source_id,
                excerpt: &result.excerpt,
            })
            .collect();

        let mut context = Context::new();
        context.insert("question", prompt.question);
        context.insert("sources", &sources);
        context
            .insert("citation_forward", &matches!(prompt.style, PromptStyle::CitationForward));
        context.insert("critique", prompt.critique);
        context.insert("strict_grounding", &prompt.strict_grounding);
        context.insert("max_answer_chars", &self.max_answer_chars);

        self.render(GENERATION_TEMPLATE, &context)
    }

    /// Deterministic confirmation question for a parked destructive
    /// call. No model round trip is involved.
    pub fn confirmation_question(
        &self,
        call: &ToolCall,
        ttl_seconds: u64,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("summary", &call.summary());
        context.insert("ttl_seconds", &ttl_seconds);
        self.render(CONFIRMATION_TEMPLATE, &context)
    }

    fn render(&self, template: &str, context: &Context) -> Result<String, PromptError> {
        self.tera.render(template, context).map_err(|error| PromptError::Render {
            template: template.to_string(),
            detail: error.to_string(),
        })
    }
}
