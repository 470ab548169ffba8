use std::path::Path;

use clap::{ArgAction, Parser};

use crate::config::Config;
use crate::dispatch::InvocationRequest;
use crate::error::LlmError;

/// Send a prompt to a language model and print the completion.
#[derive(Debug, Parser)]
#[command(name = "llm", version, about)]
pub struct Args {
    /// Prompt text (words are joined with spaces). With --file, a path to read it from.
    pub prompt: Vec<String>,

    /// Model to use. Names not known to a hosted backend go to the local script.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Sampling temperature.
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// System prompt (chat models only).
    #[arg(short, long)]
    pub system: Option<String>,

    /// Maximum tokens to generate.
    #[arg(short = 'T', long)]
    pub max_tokens: Option<u64>,

    /// Read the prompt from the file named by PROMPT.
    #[arg(short, long)]
    pub file: bool,

    /// Print only the completion. Use --quiet=false for the full transcript.
    #[arg(
        short,
        long,
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub quiet: bool,

    /// Debug logging on stderr.
    #[arg(short, long)]
    pub verbose: bool,

    /// List known models instead of sending a prompt.
    #[arg(short, long)]
    pub list: bool,

    #[arg(long, hide = true)]
    pub plugins: Vec<String>,

    #[arg(long, hide = true)]
    pub chain: Option<String>,

    #[arg(long, hide = true)]
    pub interpret: bool,
}

impl Args {
    /// True when the prompt has to come from stdin.
    pub fn wants_stdin(&self) -> bool {
        self.prompt.is_empty() && !self.file
    }

    /// Merge flags with configured defaults into a request. `stdin` is used
    /// only when no prompt was given on the command line.
    pub fn resolve(
        &self,
        config: &Config,
        stdin: Option<&str>,
    ) -> Result<InvocationRequest, LlmError> {
        if !self.plugins.is_empty() || self.chain.is_some() || self.interpret {
            tracing::warn!("--plugins, --chain and --interpret are reserved and have no effect");
        }

        let joined = self.prompt.join(" ");
        let prompt = if self.file {
            read_prompt_file(Path::new(joined.trim()))?
        } else if joined.is_empty() {
            stdin.unwrap_or_default().to_string()
        } else {
            joined
        };

        if prompt.trim().is_empty() {
            return Err(LlmError::Prompt(
                "no prompt given: pass it as an argument, with --file, or on stdin".to_string(),
            ));
        }

        Ok(InvocationRequest {
            prompt,
            model: self
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| config.default_model.clone()),
            temperature: self.temperature.unwrap_or(config.default_temperature),
            max_tokens: self.max_tokens,
            system_prompt: self
                .system
                .clone()
                .unwrap_or_else(|| config.default_system.clone()),
            quiet: self.quiet,
            verbose: self.verbose,
        })
    }
}

fn read_prompt_file(path: &Path) -> Result<String, LlmError> {
    if path.as_os_str().is_empty() {
        return Err(LlmError::Prompt("--file needs a path".to_string()));
    }
    std::fs::read_to_string(path)
        .map_err(|e| LlmError::Prompt(format!("failed to read {}: {e}", path.display())))
}
