use std::io::{IsTerminal, Read};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;

use llm::args::Args;
use llm::catalog;
use llm::config::Config;
use llm::dispatch::Dispatcher;
use llm::error::LlmError;
use llm::sink::StdoutSink;

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    load_dotenv();

    let runtime = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("invocation failed: {e:?}");
            eprintln!("{}", e.user_message().red());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), LlmError> {
    let config = Config::load();
    tracing::debug!(?config, "configuration loaded");
    let ctx = Dispatcher::new(config);

    if args.list {
        let entries = catalog::load(&ctx).await;
        print!("{}", catalog::render(&entries, chrono::Utc::now()));
        return Ok(());
    }

    let piped = if args.wants_stdin() && !std::io::stdin().is_terminal() {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| LlmError::Prompt(format!("failed to read stdin: {e}")))?;
        Some(buf)
    } else {
        None
    };

    let req = args.resolve(ctx.config(), piped.as_deref())?;
    let mut sink = StdoutSink::new(std::io::stdout().is_terminal());
    ctx.invoke(&req, &mut sink).await?;
    Ok(())
}

/// One adapter call per run, so a single-threaded runtime is enough.
fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// `.env` from the working directory, then next to the binary.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let env_path = dir.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
        }
    }
}
