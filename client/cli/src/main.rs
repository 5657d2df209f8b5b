//! Parley CLI
//!
//! Thin terminal surface over `parley-core`. Reads lines from stdin, streams
//! answers to stdout through a [`parley_core::PresentationSink`], and owns
//! the two shell-side collaborators: the JSON conversation store and the
//! diagnostics log.
//!
//! # Usage
//!
//! ```bash
//! # Talk to a local backend
//! parley --backend-url http://127.0.0.1:8000
//!
//! # With verbose core logging
//! RUST_LOG=parley_core=debug parley
//! ```
//!
//! Commands inside the REPL: `/new`, `/list`, `/open <id>`, `/mode <m>`,
//! `/docs on|off`, `/diag`, `/clear-diag`, `/quit`. Ctrl+C interrupts the
//! current answer, keeping the partial text; exit with `/quit`.

mod sink;
mod store;
mod titles;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::warn;

use parley_core::{
    ChatClient, ConversationStore, DiagnosticsLog, HttpBackend, Message, ResponseMode,
    SendOptions, StreamObserver, TitleGenerator,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for a streamed chat backend")]
struct Args {
    /// Backend base URL (e.g. http://127.0.0.1:8000)
    #[arg(long, env = "PARLEY_BACKEND_URL")]
    backend_url: Option<String>,

    /// Answer style: normal, tecnico, resumido, didatico, estrategico
    #[arg(long, default_value = "normal")]
    mode: String,

    /// Ground answers in the document library
    #[arg(long)]
    documents: bool,

    /// Conversation store path (defaults to the platform data dir)
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parley_core=warn".parse()?)
                .add_directive("parley=info".parse()?),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut mode = ResponseMode::parse(&args.mode).unwrap_or_default();
    let mut use_documents = args.documents;

    let mut config = parley_core::load_config();
    if let Some(url) = args.backend_url {
        config.backend_url = Some(url);
    }

    let backend = HttpBackend::from_config(&config);
    let diagnostics = Arc::new(DiagnosticsLog::new(512));

    let store_path = args
        .store
        .or_else(store::default_store_path)
        .ok_or_else(|| anyhow::anyhow!("no data directory available; pass --store"))?;
    let store = Arc::new(store::JsonFileStore::open(&store_path)?);

    let client = ChatClient::new(backend, config)
        .with_store(Arc::clone(&store) as Arc<dyn ConversationStore>)
        .with_observer(Arc::clone(&diagnostics) as Arc<dyn StreamObserver>);
    let titles = Arc::new(titles::BackendTitles::new(Arc::clone(client.backend())));
    let client = client.with_titles(titles as Arc<dyn TitleGenerator>);

    for conversation in store.load_all() {
        client.adopt_conversation(conversation);
    }

    let mut conversation_id = client.create_conversation();
    println!("parley: type a message, /help for commands");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("\nyou> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            match parts.next().unwrap_or("") {
                "quit" | "exit" => break,
                "new" => {
                    conversation_id = client.create_conversation();
                    println!("Started a new conversation.");
                }
                "list" => {
                    for (id, title) in client.list_conversations() {
                        println!("  {id}  {title}");
                    }
                }
                "open" => match parts.next() {
                    Some(prefix) => {
                        let found = client
                            .list_conversations()
                            .into_iter()
                            .find(|(id, _)| id.0.to_string().starts_with(prefix));
                        match found {
                            Some((id, title)) => {
                                conversation_id = id;
                                println!("Switched to: {title}");
                            }
                            None => println!("No conversation matches '{prefix}'."),
                        }
                    }
                    None => println!("Usage: /open <id prefix>"),
                },
                "mode" => match parts.next().and_then(ResponseMode::parse) {
                    Some(new_mode) => {
                        mode = new_mode;
                        println!("Mode set to {mode}.");
                    }
                    None => println!("Usage: /mode normal|tecnico|resumido|didatico|estrategico"),
                },
                "docs" => match parts.next() {
                    Some("on") => {
                        use_documents = true;
                        println!("Answers will use the document library.");
                    }
                    Some("off") => {
                        use_documents = false;
                        println!("Document grounding off.");
                    }
                    _ => println!("Usage: /docs on|off"),
                },
                "diag" => {
                    let entries = diagnostics.snapshot();
                    if entries.is_empty() {
                        println!("No diagnostics recorded.");
                    }
                    for entry in entries {
                        println!("  {} {}", entry.at.format("%H:%M:%S"), entry.detail);
                    }
                }
                "clear-diag" => {
                    diagnostics.clear();
                    println!("Diagnostics cleared.");
                }
                _ => {
                    println!(
                        "Commands: /new /list /open <id> /mode <m> /docs on|off /diag /clear-diag /quit"
                    );
                }
            }
            continue;
        }

        let options = SendOptions {
            mode,
            use_documents,
            user_id: None,
        };
        let handle = match client.send(
            conversation_id,
            line,
            options,
            Box::new(sink::StdoutHost::default()),
        ) {
            Ok(handle) => handle,
            Err(error) => {
                println!("{error}");
                continue;
            }
        };

        let cancel = handle.cancel_token();
        let join = handle.join();
        tokio::pin!(join);
        let outcome = loop {
            tokio::select! {
                result = &mut join => break result,
                _ = tokio::signal::ctrl_c() => {
                    // Ctrl+C mid-answer interrupts the answer, not the program.
                    cancel.cancel();
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                println!();
                if outcome.message.interrupted {
                    println!("[interrupted]");
                }
                print_attachments(&outcome.message);
            }
            Err(error) => warn!(error = %error, "Send task failed"),
        }
    }

    Ok(())
}

/// Print sources and artifacts attached to a finalized answer.
fn print_attachments(message: &Message) {
    if !message.sources.is_empty() {
        println!("Sources:");
        for (index, source) in message.sources.iter().enumerate() {
            let name = source
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            match source.get("ref").and_then(|v| v.as_str()) {
                Some(reference) => println!("  [{reference}] {name}"),
                None => println!("  [{}] {name}", index + 1),
            }
        }
    }
    for artifact in &message.artifacts {
        let name = artifact
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("artifact");
        match artifact.get("url").and_then(|v| v.as_str()) {
            Some(url) => println!("Artifact: {name} ({url})"),
            None => println!("Artifact: {name}"),
        }
    }
}
