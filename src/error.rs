use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing credential {credential}")]
    Configuration {
        credential: String,
        remediation: String,
    },

    #[error("invalid credential {credential}")]
    InvalidCredential {
        credential: String,
        remediation: String,
    },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("process exited with code {code}: {output}")]
    ProcessExit { code: i32, output: String },

    #[error("failed to spawn local model: {0}")]
    Spawn(String),

    #[error("invalid prompt: {0}")]
    Prompt(String),
}

impl LlmError {
    pub fn missing(credential: &str, remediation: &str) -> Self {
        Self::Configuration {
            credential: credential.to_string(),
            remediation: remediation.to_string(),
        }
    }

    /// A credential that is present but unusable, e.g. not a valid header value.
    pub fn invalid(credential: &str, remediation: &str) -> Self {
        Self::InvalidCredential {
            credential: credential.to_string(),
            remediation: remediation.to_string(),
        }
    }

    /// True for a missing or unusable credential. These are raised before any
    /// network or process activity.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::InvalidCredential { .. })
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        if self.is_configuration() { 2 } else { 1 }
    }

    /// Message printed to the terminal by the top-level handler.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration {
                credential,
                remediation,
            } => {
                format!("{credential} is not set.\n{remediation}")
            }
            Self::InvalidCredential {
                credential,
                remediation,
            } => {
                format!("{credential} is set but cannot be used.\n{remediation}")
            }
            Self::Upstream {
                provider,
                message,
                status: Some(status),
            } => format!("{provider} request failed ({status}): {message}"),
            Self::Upstream {
                provider, message, ..
            } => format!("{provider} request failed: {message}"),
            Self::Request(e) => format!("request failed: {e}"),
            Self::SchemaParse(msg) => format!("unexpected provider response: {msg}"),
            Self::ProcessExit { code, output } => {
                if output.trim().is_empty() {
                    format!("local model exited with code {code}")
                } else {
                    // Scripts print banners first, the real error is at the end.
                    let tail: String = output
                        .chars()
                        .rev()
                        .take(400)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    let prefix = if tail.len() < output.len() { "..." } else { "" };
                    format!("local model exited with code {code}: {prefix}{}", tail.trim_end())
                }
            }
            Self::Spawn(msg) => format!("failed to start local model: {msg}"),
            Self::Prompt(msg) => msg.clone(),
        }
    }
}
