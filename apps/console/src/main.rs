use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use platform_link::fake::FakeSessionLibrary;
use serde::Serialize;
use session_core::{SessionOrchestrator, StatusDispatcher};
use shared::protocol::PushEvent;
use storage::FsCredentialStore;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{ConsoleCommand, HELP};
use config::load_settings;

const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives a messaging session from the terminal. Events are printed as JSON lines.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "session.toml")]
    config: PathBuf,
    #[arg(long)]
    session_dir: Option<PathBuf>,
    /// Phone number used when the platform asks for pairing.
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    block_cooldown_secs: Option<u64>,
    #[arg(long)]
    sync_fallback_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(dir) = args.session_dir {
        settings.session_dir = dir;
    }
    if args.phone.is_some() {
        settings.default_phone = args.phone;
    }
    if let Some(secs) = args.block_cooldown_secs {
        settings.block_cooldown_secs = secs;
    }
    if let Some(secs) = args.sync_fallback_secs {
        settings.sync_fallback_secs = secs;
    }
    let config = settings.orchestrator_config()?;
    info!(
        dir = %config.session_dir.display(),
        paired = FsCredentialStore::is_paired(&config.session_dir).await,
        "console: starting"
    );

    let library = FakeSessionLibrary::new();
    let dispatcher = Arc::new(StatusDispatcher::new());
    let printer = tokio::spawn(forward_push_events(
        BroadcastStream::new(dispatcher.subscribe_push()),
        |event| {
            if let Err(err) = print_json(event) {
                warn!("console: failed to encode event: {err}");
            }
        },
    ));
    let orchestrator = SessionOrchestrator::spawn(
        config,
        Arc::new(library.clone()),
        Arc::new(FsCredentialStore::new()),
        dispatcher,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                print_error(&err);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(err) = execute(&orchestrator, &library, command).await {
            print_error(&err);
        }
    }

    shut_down(orchestrator, printer).await;
    Ok(())
}

/// Stops the session and waits for the printer to flush the final events.
async fn shut_down(orchestrator: SessionOrchestrator, printer: JoinHandle<()>) {
    if let Err(err) = orchestrator.stop().await {
        warn!("console: stop on exit failed: {err}");
    }
    // The owner task holds the last dispatcher reference; once it exits the
    // push stream ends and the printer drains what is left.
    drop(orchestrator);
    if tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await.is_err() {
        warn!("console: pending events were not printed before exit");
    }
}

async fn execute(
    orchestrator: &SessionOrchestrator,
    library: &FakeSessionLibrary,
    command: ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Start { phone } => orchestrator.start(phone.as_deref()).await?,
        ConsoleCommand::Stop => orchestrator.stop().await?,
        ConsoleCommand::Clear => orchestrator.clear_session().await?,
        ConsoleCommand::Pair { phone } => {
            let code = orchestrator.request_pairing_code(&phone).await?;
            info!(%code, "console: pairing code issued");
        }
        ConsoleCommand::Status => print_json(&orchestrator.status().await?)?,
        ConsoleCommand::Snapshot => print_json(&orchestrator.snapshot().await?)?,
        ConsoleCommand::SendText { jid, text } => {
            orchestrator.sender().send_text(&jid, text).await?;
        }
        ConsoleCommand::SendBinary { jid, data } => {
            orchestrator.sender().send_binary(&jid, data, None).await?;
        }
        ConsoleCommand::Inject(event) => {
            let Some(session) = library.last_session().await else {
                anyhow::bail!("no session has been opened yet");
            };
            if !session.emit(event) {
                anyhow::bail!("the last session is no longer listened to");
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn forward_push_events(
    mut events: BroadcastStream<PushEvent>,
    mut output: impl FnMut(&PushEvent) + Send,
) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => output(&event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "console: output fell behind, events dropped");
            }
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_error(err: &anyhow::Error) {
    println!("{}", serde_json::json!({ "type": "error", "message": format!("{err:#}") }));
}
