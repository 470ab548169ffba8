pub mod chat;
pub mod cli;
pub mod completion;
pub mod openai;
pub mod router;
pub mod session;

use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::config::Config;
use crate::dispatch::chat::ChatDispatch;
use crate::dispatch::cli::CliDispatch;
use crate::dispatch::completion::CompletionDispatch;
use crate::dispatch::openai::OpenAiClient;
use crate::dispatch::router::Backend;
use crate::dispatch::session::{BingSession, SessionDispatch};
use crate::error::LlmError;
use crate::sink::OutputSink;

/// Client-side ceiling for a single generation. Long on purpose: slow
/// generations should finish rather than fail.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Fully resolved request handed to an adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct InvocationRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u64>,
    pub system_prompt: String,
    /// Suppresses framing lines; the completion is always written.
    pub quiet: bool,
    pub verbose: bool,
}

/// What every adapter returns. Only `text` is uniform; `raw` is whatever the
/// backend produced.
#[derive(Debug)]
pub struct AdapterResult {
    pub text: String,
    pub raw: serde_json::Value,
}

/// One model-serving backend.
#[allow(async_fn_in_trait)]
pub trait Adapter {
    async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError>;
}

/// Per-process context: configuration plus lazily built clients that are
/// reused for every call made through this value.
pub struct Dispatcher {
    config: Config,
    openai: OnceLock<OpenAiClient>,
    session: OnceCell<BingSession>,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            openai: OnceLock::new(),
            session: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared OpenAI client. Fails before any network activity when the key
    /// is absent.
    pub fn openai(&self) -> Result<&OpenAiClient, LlmError> {
        if let Some(client) = self.openai.get() {
            return Ok(client);
        }
        let key = self.config.openai_api_key.as_deref().ok_or_else(|| {
            LlmError::missing(
                "OPENAI_API_KEY",
                "Create a key at https://platform.openai.com/account/api-keys and export it:\n  \
                 export OPENAI_API_KEY=sk-...\n\
                 Set OPENAI_ORGANIZATION_ID as well if your account belongs to an organization.",
            )
        })?;
        let client = OpenAiClient::new(
            &self.config.openai_base_url,
            key,
            self.config.openai_organization.as_deref(),
        )?;
        Ok(self.openai.get_or_init(|| client))
    }

    /// Cookie-authenticated session, created on first use and kept for the
    /// lifetime of this dispatcher.
    pub async fn session(&self) -> Result<&BingSession, LlmError> {
        let cookie = self.config.bing_cookie.as_deref().ok_or_else(|| {
            LlmError::missing(
                "BING_COOKIE",
                "Sign in to https://www.bing.com/chat in your browser, open the developer tools,\n\
                 copy the value of the `_U` cookie for bing.com and export it:\n  \
                 export BING_COOKIE=<value>",
            )
        })?;
        self.session
            .get_or_try_init(|| {
                BingSession::create(&self.config.bing_base_url, &self.config.bing_hub_url, cookie)
            })
            .await
    }

    /// True once the session has been created in this process.
    pub fn has_session(&self) -> bool {
        self.session.initialized()
    }

    /// Route `req.model` and run exactly one adapter. No retry, no fallback.
    pub async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError> {
        if req.prompt.trim().is_empty() {
            return Err(LlmError::Prompt("prompt is empty".to_string()));
        }

        let backend = router::route(&req.model);
        tracing::debug!(model = %req.model, backend = backend.name(), "routed");

        match backend {
            Backend::Completion => CompletionDispatch::new(self).invoke(req, sink).await,
            Backend::Chat => ChatDispatch::new(self).invoke(req, sink).await,
            Backend::Session => SessionDispatch::new(self).invoke(req, sink).await,
            Backend::Local => CliDispatch::new(&self.config.local).invoke(req, sink).await,
        }
    }
}
