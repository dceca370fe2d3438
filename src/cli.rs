//! Command-line interface parsing and handling.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientStreamState, OutgoingMessage, StreamConsumer, StreamPhase};
use crate::config::AppConfig;
use crate::orchestrator::ChatOrchestrator;
use crate::server;
use crate::types::{ChatMessage, ChatOptions, ChatRequest, StreamEvent, Tokens};

#[derive(Parser)]
#[command(name = "aiui")]
#[command(about = "Chat orchestration over OpenAI, Gemini and Llama with streamed replies")]
#[command(
    long_about = "aiui routes chat requests to OpenAI, Gemini or a local Llama server based on \
the model id, optionally running a planning pass before the answer, and streams progress as \
server-sent events.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    OpenAI API key (when not set in the config file)\n\
  GEMINI_API_KEY    Gemini API key (when not set in the config file)\n\
  LLAMA_API_URL     Base URL of the local Llama server\n\
  DEFAULT_MODEL     Model used when a request names none\n\
  AI_ENABLED=false  Echo replies instead of calling providers\n\
  AIUI_BIND         Server bind address\n\
  RUST_LOG          Log filter (overrides [logging].level)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.aiui/config.toml)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one request through the orchestrator without a server
    Ask {
        /// Message to send
        message: String,
        /// Model id; the configured fallback model when omitted
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// Include the persona document
        #[arg(long)]
        persona: bool,
        /// Run a planning pass before answering
        #[arg(long)]
        plan: bool,
        /// Print fragments as they arrive
        #[arg(short = 's', long)]
        stream: bool,
    },
    /// Start the HTTP server
    Serve {
        /// Address to bind, overriding the config file
        #[arg(short = 'b', long)]
        bind: Option<String>,
    },
    /// Send a message to a running server and follow its event stream
    Send {
        /// Message to send
        message: String,
        /// Existing conversation; a new one is created when omitted
        #[arg(long)]
        conversation: Option<u64>,
        #[arg(short = 'm', long)]
        model: Option<String>,
        #[arg(long)]
        persona: bool,
        #[arg(long)]
        plan: bool,
        /// Server URL, overriding the config file
        #[arg(long)]
        server: Option<String>,
        /// Bearer token, overriding the config file
        #[arg(long)]
        token: Option<String>,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Load the config, creating the default file on first run.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let mut config = AppConfig::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        return Ok(config);
    }

    let config_path = AppConfig::config_path()?;
    if !config_path.exists() {
        let path = AppConfig::save_default()?;
        eprintln!("[Config] Created default config: {}", path.display());
    }
    AppConfig::load()
}

pub fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => AppConfig::config_path()?,
    };
    if target.exists() && !force {
        println!(
            "[Config] {} already exists (use --force to overwrite)",
            target.display()
        );
        return Ok(());
    }
    AppConfig::write_default(&target)?;
    println!("[Config] Wrote {}", target.display());
    Ok(())
}

pub async fn run(command: Commands, mut config: AppConfig) -> Result<()> {
    match command {
        Commands::Ask {
            message,
            model,
            persona,
            plan,
            stream,
        } => {
            let options = ChatOptions {
                use_persona: persona,
                use_scaffolding: plan,
                stream,
            };
            ask(&config, ChatRequest::new(vec![ChatMessage::user(message)], model, options)).await
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            server::serve(&config).await
        }
        Commands::Send {
            message,
            conversation,
            model,
            persona,
            plan,
            server,
            token,
        } => {
            if let Some(server) = server {
                config.client.server_url = server;
            }
            if token.is_some() {
                config.client.token = token;
            }
            let mut consumer = StreamConsumer::from_config(&config.client);
            let conversation_id = match conversation {
                Some(id) => id,
                None => consumer.create_conversation().await?,
            };
            let outgoing = OutgoingMessage {
                conversation_id,
                content: message,
                model,
                use_persona: persona,
                use_scaffolding: plan,
            };
            send(&mut consumer, outgoing).await
        }
        Commands::InitConfig { force } => init_config(None, force),
    }
}

async fn ask(config: &AppConfig, request: ChatRequest) -> Result<()> {
    let orchestrator = ChatOrchestrator::from_config(config);

    if !request.stream {
        let result = orchestrator.complete(&request).await?;
        if let Some(thinking) = &result.thinking {
            println!("[thinking]\n{thinking}\n");
        }
        println!("{}", result.reply);
        match result.tokens {
            Tokens::TwoPass(usage) => eprintln!(
                "[tokens] planning {} + execution {} = {}",
                usage.planning.total_tokens, usage.execution.total_tokens, usage.total
            ),
            Tokens::Single(usage) => eprintln!("[tokens] {}", usage.total_tokens),
        }
        return Ok(());
    }

    let (mut tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let printer = tokio::spawn(async move {
        let mut last: Option<&'static str> = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Thinking(text) => print_section(&mut last, "thinking", &text),
                StreamEvent::Response(text) => print_section(&mut last, "response", &text),
                StreamEvent::Done => println!(),
                StreamEvent::Error(message) => eprintln!("\n[error] {message}"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = orchestrator.stream(&request, &mut tx, &cancel).await;
    drop(tx);
    let _ = printer.await;
    outcome?;
    Ok(())
}

fn print_section(last: &mut Option<&'static str>, section: &'static str, text: &str) {
    if *last != Some(section) {
        print!("\n[{section}]\n");
        *last = Some(section);
    }
    print!("{text}");
    let _ = std::io::stdout().flush();
}

async fn send(consumer: &mut StreamConsumer, message: OutgoingMessage) -> Result<()> {
    let mut updates = consumer.subscribe();
    let printer = tokio::spawn(async move {
        let mut progress = Progress::default();
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update().clone();
            progress.show(&state);
        }
    });

    let handle = consumer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let outcome = consumer.send_message(message).await;
    let state = consumer.state().clone();
    // let the printer catch up with the final state
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    printer.abort();
    println!();

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            eprintln!("[cancelled]");
            Ok(())
        }
        Err(_) => anyhow::bail!(
            "{}",
            state.error.unwrap_or_else(|| "stream failed".to_string())
        ),
    }
}

/// Tracks what has been printed so only new text is written.
#[derive(Default)]
struct Progress {
    thinking: usize,
    response: usize,
    last: Option<&'static str>,
}

impl Progress {
    fn show(&mut self, state: &ClientStreamState) {
        if state.phase == StreamPhase::Connecting {
            *self = Progress::default();
            return;
        }
        if let Some(text) = state.thinking_text.get(self.thinking..) {
            if !text.is_empty() {
                print_section(&mut self.last, "thinking", text);
            }
            self.thinking = state.thinking_text.len();
        }
        if let Some(text) = state.response_text.get(self.response..) {
            if !text.is_empty() {
                print_section(&mut self.last, "response", text);
            }
            self.response = state.response_text.len();
        }
    }
}
