use std::{
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use llmchat_engine::{ensure_engine_dir, LlamaEngine};
use llmchat_session::{
    hub_api, input::EventSender, ChannelInput, ChatConfig, ChatSession, ChatTokenizer, InputEvent,
};
use tokio::signal;
use tracing::{error, info};
use tracing_appender::{
    non_blocking,
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    prelude::*,
    EnvFilter, Registry,
};

/// The name of the environment variable for the Hugging Face token
const HF_TOKEN: &str = "HF_TOKEN";
/// The directory where the logs are stored.
const LOGS: &str = "./logs";
/// The log file name.
const LOG_FILE: &str = "llmchat.log";

/// Command line arguments for the chat client
#[derive(Parser)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config_path: PathBuf,

    /// Directory holding the downloaded model's tokenizer files
    #[arg(short, long, default_value = "./model_download")]
    model_dir: PathBuf,

    /// Directory holding the compiled engine (model config and weights)
    #[arg(short, long, default_value = "./engine_output")]
    engine_dir: PathBuf,
}

fn main() -> Result<()> {
    let _guard = setup_logging(LOGS).context("Failed to setup logging")?;
    dotenv().ok();

    let args = Args::parse();
    let result = run(args);
    if let Err(e) = &result {
        error!(error = ?e, "Chat client terminated");
    }
    result
}

fn run(args: Args) -> Result<()> {
    let config = ChatConfig::from_file_path(&args.config_path).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config_path.display()
        )
    })?;

    ensure_engine_dir(&args.engine_dir).context("Build the engine before starting the chat")?;

    info!("Initializing tokenizer and engine, this may take a while...");

    let hub = hub_api(std::env::var(HF_TOKEN).ok()).context("Failed to build Hugging Face client")?;
    let tokenizer = ChatTokenizer::load(
        &args.model_dir,
        &hub,
        &config.model_id,
        &config.revision,
        config.chat_template,
    )
    .context("Failed to load tokenizer")?;

    let engine = LlamaEngine::load(&args.engine_dir, config.engine_options())
        .context("Failed to load engine")?;

    let mut session = ChatSession::new(engine, tokenizer, &config);

    let (events, input) = ChannelInput::spawn_reader(BufReader::new(io::stdin()))
        .context("Failed to spawn input reader")?;
    listen_for_interrupts(events)?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    print_banner(&mut stdout, &config)?;
    session.run(input, stdout)?;

    Ok(())
}

/// Delivers every Ctrl-C to the session as an input event. A press during
/// generation takes effect at the next prompt.
fn listen_for_interrupts(events: EventSender) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("Failed to build signal runtime")?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                loop {
                    if let Err(e) = signal::ctrl_c().await {
                        error!(error = %e, "Failed to listen for Ctrl-C");
                        break;
                    }
                    if events.send(Ok(InputEvent::Interrupt)).is_err() {
                        break;
                    }
                }
            })
        })
        .context("Failed to spawn Ctrl-C listener")?;
    Ok(())
}

fn print_banner<W: Write>(output: &mut W, config: &ChatConfig) -> io::Result<()> {
    let exit_words = config
        .exit_words
        .iter()
        .map(|word| format!("'{word}'"))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(output, "\n==========================================")?;
    writeln!(output, " LLM CLI Chat")?;
    writeln!(output, " Model: {}", config.model_id)?;
    writeln!(output, " Type {exit_words} to end the conversation")?;
    writeln!(output, "==========================================\n")
}

/// Configure logging with JSON formatting to a rolling file and compact
/// console output on stderr, keeping stdout free for the conversation.
fn setup_logging<P: AsRef<Path>>(log_dir: P) -> Result<WorkerGuard> {
    // Set up file appender with rotation
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE)
        .build(log_dir)
        .context("Failed to create log file appender")?;

    // Create a non-blocking writer
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    // Create JSON formatter for file output
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_appender);

    let console_layer = fmt::layer()
        .compact()
        .without_time()
        .with_target(false)
        .with_writer(io::stderr);

    // Create filter from environment variable or default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
