//! Agent console
//!
//! Boots the phone session manager and drives it from stdin:
//! 1. Loads the session config from a JSON file and/or flags
//! 2. Connects to the routing server (or a simulated one with `--simulate`)
//! 3. Prints status line changes and notices as they happen
//! 4. Runs console commands (`help` lists them) until `quit` or Ctrl-C
//!
//! There is no telephony SDK binding yet, so calls always go through the
//! simulated device; use `ring` to place an incoming call.

mod commands;
mod sim;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentdesk_phone_core::audio::MockMediaBackend;
use agentdesk_phone_core::signalling::{MemoryTransport, WsTransport};
use agentdesk_phone_core::telephony::{CallObjectEvent, MockTelephony};
use agentdesk_phone_core::{
    HttpTokenProvider, LogNotifier, NoticeLevel, SessionConfig, SessionDeps, SessionHandle, SessionManager,
    SessionNotice, SessionSnapshot,
};

use commands::{ConsoleCommand, HELP};

#[derive(Parser, Debug)]
#[command(author, version, about = "Agent console for inbound calls", long_about = None)]
struct Args {
    /// JSON session config; flags override its fields
    #[arg(short, long, env = "AGENTDESK_CONFIG")]
    config: Option<PathBuf>,

    /// Agent identifier announced to the routing server
    #[arg(short, long, env = "AGENTDESK_AGENT_ID")]
    agent_id: Option<String>,

    /// Telephony identity tokens are issued for (defaults to the agent id)
    #[arg(short, long, env = "AGENTDESK_IDENTITY")]
    identity: Option<String>,

    /// Base URL of the REST backend
    #[arg(long, env = "AGENTDESK_API_URL")]
    api_url: Option<String>,

    /// Bearer credential of the dashboard session
    #[arg(long, env = "AGENTDESK_API_BEARER", hide_env_values = true)]
    bearer: Option<String>,

    /// WebSocket URL of the routing server
    #[arg(long, env = "AGENTDESK_SIGNALLING_URL")]
    signalling_url: Option<String>,

    /// Run against an in-process routing server and token issuer
    #[arg(long)]
    simulate: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => {
                let Some(agent_id) = &self.agent_id else {
                    bail!("either --config or --agent-id is required");
                };
                let identity = self.identity.clone().unwrap_or_else(|| agent_id.clone());
                SessionConfig::new(agent_id.clone(), identity)
            }
        };

        if let Some(agent_id) = &self.agent_id {
            config.agent_id = agent_id.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity = identity.clone();
        }
        if let Some(url) = &self.api_url {
            config = config.with_api_base_url(url.clone());
        }
        if let Some(bearer) = &self.bearer {
            config = config.with_api_bearer(bearer.clone());
        }
        if let Some(url) = &self.signalling_url {
            config = config.with_signalling_url(url.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Backends the console runs against, with handles kept for the simulation commands
struct Console {
    session: SessionHandle,
    telephony: MockTelephony,
}

fn start_session(args: &Args, config: SessionConfig) -> Result<Console> {
    let telephony = MockTelephony::new();
    let media = Arc::new(MockMediaBackend::new());
    let notifier = Arc::new(LogNotifier::new(true));

    let deps = if args.simulate {
        let transport = MemoryTransport::new();
        sim::spawn_routing_server(transport.clone(), Duration::from_millis(200));
        SessionDeps {
            telephony: Arc::new(telephony.clone()),
            tokens: Arc::new(sim::SimulatedTokens::default()),
            transport: Arc::new(transport),
            media,
            notifier,
        }
    } else {
        SessionDeps {
            telephony: Arc::new(telephony.clone()),
            tokens: Arc::new(HttpTokenProvider::new(&config.api_base_url, config.api_bearer.clone())),
            transport: Arc::new(WsTransport::new()),
            media,
            notifier,
        }
    };

    let session = SessionManager::start(config, deps)?;
    Ok(Console { session, telephony })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = args.session_config()?;
    info!(agent_id = %config.agent_id, simulate = args.simulate, "Starting agent console");
    let console = start_session(&args, config)?;

    println!("{}", HELP);
    run(&console).await?;

    if let Err(e) = console.session.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }
    console.session.closed().await;
    info!("Agent console stopped");
    Ok(())
}

async fn run(console: &Console) -> Result<()> {
    let mut snapshots = console.session.subscribe();
    let mut notices = console.session.notices();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status = String::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match ConsoleCommand::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(console, command).await {
                            println!("! {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_line(&snapshots.borrow_and_update());
                if status != last_status {
                    println!("{}", status);
                    last_status = status;
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind on notices"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn execute(console: &Console, command: ConsoleCommand) -> Result<()> {
    let session = &console.session;
    match command {
        ConsoleCommand::Accept => session.accept().await?,
        ConsoleCommand::Reject => session.reject().await?,
        ConsoleCommand::End => session.end().await?,
        ConsoleCommand::Mute => session.toggle_mute().await?,
        ConsoleCommand::Dial(to) => session.dial(to).await?,
        ConsoleCommand::Input(id) => session.select_input(id).await?,
        ConsoleCommand::Output(id) => session.select_output(id).await?,
        ConsoleCommand::TestSpeaker => session.test_speaker().await?,
        ConsoleCommand::Microphone => session.retry_microphone().await?,
        ConsoleCommand::Reconnect => session.reconnect().await?,
        ConsoleCommand::Devices => {
            session.refresh_devices().await?;
            print_devices(&session.snapshot());
        }
        ConsoleCommand::Status => print_status(&session.snapshot()),
        ConsoleCommand::Ring(from) => {
            if console.telephony.ring(&from).is_none() {
                bail!("the phone is not registered yet");
            }
        }
        ConsoleCommand::RemoteHangup => {
            let Some(call) = console.telephony.calls().last().cloned() else {
                bail!("no call to hang up");
            };
            call.emit(CallObjectEvent::Disconnected);
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn status_line(snapshot: &SessionSnapshot) -> String {
    let call = &snapshot.call;
    let mut line = format!("[{}] {}", snapshot.status, snapshot.status_message);
    if !call.is_idle() {
        line.push_str(&format!(
            " | call {} {}",
            call.state,
            call.remote_identity.as_deref().unwrap_or("")
        ));
        if call.muted {
            line.push_str(" (muted)");
        }
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!(" | {}", error));
    }
    if snapshot.can_reconnect {
        line.push_str(" | type 'reconnect' to retry");
    }
    line
}

fn print_status(snapshot: &SessionSnapshot) {
    let connection = &snapshot.connection;
    println!("{}", status_line(snapshot));
    println!(
        "  signalling: {} (attempts {}), device: {} (attempts {})",
        connection.signalling, connection.reconnect_attempts, connection.device, connection.registration_attempts
    );
    if let Some(age) = connection.heartbeat_age {
        println!("  last heartbeat {}s ago", age.as_secs());
    }
    let call = &snapshot.call;
    if !call.is_idle() {
        println!(
            "  call: {} {}s quality {}",
            call.state,
            call.duration_seconds,
            call.quality.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    let audio = &snapshot.audio;
    println!(
        "  microphone: {} level {:.2}, output level {:.2}",
        if audio.has_mic_permission { "on" } else { "off" },
        audio.input_level,
        audio.output_level
    );
}

fn print_devices(snapshot: &SessionSnapshot) {
    let audio = &snapshot.audio;
    println!("input devices:");
    for device in &audio.input_devices {
        let marker = if audio.selected_input.as_deref() == Some(device.id.as_str()) { "*" } else { " " };
        println!("  {} {} ({})", marker, device.label, device.id);
    }
    println!("output devices:");
    for device in &audio.output_devices {
        let marker = if audio.selected_output.as_deref() == Some(device.id.as_str()) { "*" } else { " " };
        println!("  {} {} ({})", marker, device.label, device.id);
    }
}

fn print_notice(notice: &SessionNotice) {
    let prefix = match notice.level() {
        NoticeLevel::Info => "-",
        NoticeLevel::Warning => "~",
        NoticeLevel::Error => "!",
    };
    println!("{} {}", prefix, notice.message());
}
