/// Models served by the legacy text-completion endpoint.
pub const COMPLETION_MODELS: &[&str] = &[
    "text-davinci-003",
    "text-davinci-002",
    "text-curie-001",
    "text-babbage-001",
    "text-ada-001",
    "davinci",
    "curie",
    "babbage",
    "ada",
];

/// Models served by the chat-completions endpoint.
pub const CHAT_MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-0301",
    "gpt-4",
    "gpt-4-0314",
    "gpt-4-32k",
    "gpt-4-32k-0314",
];

/// Every model name starting with this goes to the session backend.
pub const SESSION_PREFIX: &str = "bing-";

/// The finite set of backends a model name can land on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Completion,
    Chat,
    Session,
    /// Catch-all: the name is forwarded to the local script as-is.
    Local,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completion => "openai-completion",
            Self::Chat => "openai-chat",
            Self::Session => "bing",
            Self::Local => "local",
        }
    }
}

/// Total and pure: every string maps to exactly one backend.
pub fn route(model: &str) -> Backend {
    if COMPLETION_MODELS.contains(&model) {
        Backend::Completion
    } else if CHAT_MODELS.contains(&model) {
        Backend::Chat
    } else if model.starts_with(SESSION_PREFIX) {
        Backend::Session
    } else {
        Backend::Local
    }
}
