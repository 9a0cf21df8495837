use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use tritone_core::{
    config::{Config, HttpCfg, StreamCfg, UpstreamCfg},
    demux::{Demultiplexer, RenderSink},
    error::error_body,
    markdown,
    model::Tone,
    mux::Multiplexer,
    provider::{ScriptedProvider, StreamingProvider},
    providers::anthropic::Anthropic,
    session::ChatSession,
};

#[derive(Parser)]
#[command(author, version, about = "tritone CLI smoke tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and stream all three tone variants back
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Config file (JSON or TOML)")]
        config: Option<PathBuf>,
    },
    /// Render a markdown file to safe HTML and print it
    Render {
        #[arg(long)]
        file: PathBuf,
    },
}

/// Collects the latest rendered HTML per tone; printed once the exchange
/// settles rather than repainting a terminal.
#[derive(Default)]
struct CollectingSink {
    content: HashMap<Tone, String>,
    thinking: HashMap<Tone, String>,
}

impl RenderSink for CollectingSink {
    fn content_update(&mut self, tone: Tone, html: &str) {
        self.content.insert(tone, html.to_string());
    }
    fn thinking_update(&mut self, tone: Tone, html: &str) {
        self.thinking.insert(tone, html.to_string());
    }
    fn thinking_revealed(&mut self, tone: Tone) {
        eprintln!("[{tone}: thinking...]");
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Ok(Config::from_path(path)?);
    }
    Ok(Config {
        upstream: UpstreamCfg {
            api_key_env: "ANTHROPIC_API_KEY".into(),
            base: "https://api.anthropic.com".into(),
            model: "claude-sonnet-4-5".into(),
            max_output_tokens: 1024,
            thinking_budget_tokens: 2048,
        },
        stream: StreamCfg::default(),
        http: HttpCfg::default(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Chat { message, config } => chat(&message, config.as_ref()).await,
        Commands::Render { file } => {
            let text = std::fs::read_to_string(&file)?;
            println!("{}", markdown::render(&text));
            Ok(())
        }
    }
}

async fn chat(message: &str, config_path: Option<&PathBuf>) -> anyhow::Result<()> {
    let cfg = load_config(config_path)?;

    // Fall back to a canned provider when no credential is present, so the
    // full pipeline can be exercised offline.
    let provider: Arc<dyn StreamingProvider> = match Anthropic::from_config(&cfg) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("[no upstream: {e}; using scripted echo]");
            Arc::new(ScriptedProvider::echoing(message))
        }
    };

    let mut session = ChatSession::new(cfg.transcript_tone()?);
    if !session.push_user(message) {
        eprintln!("{}", error_body("message is empty"));
        std::process::exit(2);
    }

    let mux = Multiplexer::all_tones(provider, cfg.stream.channel_capacity);
    let mut stream = mux.open(session.history().to_vec());
    let mut demux = Demultiplexer::new(
        CollectingSink::default(),
        Duration::from_millis(cfg.stream.render_interval_ms),
    );

    let mut received_any = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                received_any = true;
                demux.feed(&bytes);
            }
            Err(e) => {
                if !received_any {
                    // Failed before any stream bytes: single JSON error body.
                    eprintln!("{}", error_body(&e.to_string()));
                    std::process::exit(2);
                }
                eprintln!("[stream error: {e}]");
                break;
            }
        }
    }
    if !demux.is_complete() {
        demux.finish();
    }

    session.absorb_exchange(&demux);
    let sink = demux.into_sink();
    for tone in Tone::ALL {
        println!("== {tone} ==");
        if let Some(thinking) = sink.thinking.get(&tone) {
            println!("-- thinking --");
            println!("{thinking}");
            println!("-- response --");
        }
        println!("{}", sink.content.get(&tone).map(String::as_str).unwrap_or(""));
        println!();
    }
    Ok(())
}
