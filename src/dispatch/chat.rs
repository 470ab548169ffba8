use serde::{Deserialize, Serialize};

use crate::dispatch::openai::PROVIDER;
use crate::dispatch::{Adapter, AdapterResult, Dispatcher, InvocationRequest};
use crate::error::LlmError;
use crate::sink::OutputSink;
use crate::text::ensure_trailing_newline;

/// Chat-completions endpoint. Every call is a fresh two-message
/// conversation: one system message, one user message.
pub struct ChatDispatch<'a> {
    ctx: &'a Dispatcher,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl<'a> ChatDispatch<'a> {
    pub fn new(ctx: &'a Dispatcher) -> Self {
        Self { ctx }
    }
}

impl Adapter for ChatDispatch<'_> {
    async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError> {
        let client = self.ctx.openai()?;

        if !req.quiet {
            // Transcript shape is fixed: the system line is printed even when empty.
            sink.frame(&format!("system: {}\n", req.system_prompt));
            sink.frame(&ensure_trailing_newline(&format!("user: {}", req.prompt)));
            sink.frame("assistant: ");
        }

        let body = ChatBody {
            model: &req.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &req.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &req.prompt,
                },
            ],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        tracing::debug!(model = %req.model, "POST /chat/completions");

        let (completion, raw): (ChatCompletion, _) =
            client.post("/chat/completions", &body).await?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Upstream {
                provider: PROVIDER.to_string(),
                message: "empty choices or null content".to_string(),
                status: None,
            })?;

        sink.write(&ensure_trailing_newline(&text));
        Ok(AdapterResult { text, raw })
    }
}
