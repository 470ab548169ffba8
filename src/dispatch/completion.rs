use serde::{Deserialize, Serialize};

use crate::dispatch::openai::PROVIDER;
use crate::dispatch::{Adapter, AdapterResult, Dispatcher, InvocationRequest};
use crate::error::LlmError;
use crate::sink::OutputSink;
use crate::text::ensure_trailing_newline;

/// Single-turn "complete this text" endpoint. System prompts are not
/// supported and are ignored.
pub struct CompletionDispatch<'a> {
    ctx: &'a Dispatcher,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    text: Option<String>,
}

impl<'a> CompletionDispatch<'a> {
    pub fn new(ctx: &'a Dispatcher) -> Self {
        Self { ctx }
    }
}

impl Adapter for CompletionDispatch<'_> {
    async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError> {
        let client = self.ctx.openai()?;

        if !req.quiet {
            sink.frame(&ensure_trailing_newline(&req.prompt));
        }

        let body = CompletionBody {
            model: &req.model,
            prompt: &req.prompt,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        tracing::debug!(model = %req.model, "POST /completions");

        let (completion, raw): (Completion, _) = client.post("/completions", &body).await?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.text)
            .ok_or_else(|| LlmError::Upstream {
                provider: PROVIDER.to_string(),
                message: "empty choices or null text".to_string(),
                status: None,
            })?;

        sink.write(&ensure_trailing_newline(&text));
        Ok(AdapterResult { text, raw })
    }
}
