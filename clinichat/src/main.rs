//! `clinichat`: line-oriented clinic chat client.
//!
//! Connects to the clinic backend with a staff token or as a guest, keeps
//! the conversation list in sync and lets the user read and write messages.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/clinichat/config.toml`).
//!
//! ```bash
//! # As a guest (id minted on first run)
//! cargo run --bin clinichat -- --relay-url ws://127.0.0.1:9000/ws \
//!     --api-url http://127.0.0.1:9000/
//!
//! # As staff
//! CLINICHAT_TOKEN=... cargo run --bin clinichat
//! ```
//!
//! Commands: `/list [guest|internal]`, `/open <id>`, `/close`, `/refresh`,
//! `/reconnect`, `/quit`, `@<id> <text>` to send; plain text goes to the
//! open conversation.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use clinichat::channel::relay::RelayConnector;
use clinichat::client::{self, Client, ClientCommand, ClientUpdate};
use clinichat::clock::SystemClock;
use clinichat::config::{CliArgs, ClientConfig};
use clinichat::connection::ConnectionManager;
use clinichat::gateway::http::HttpGateway;
use clinichat::persist::file::FilePersistence;
use clinichat::rank::ConversationSummary;
use clinichat::sync::{ConversationSync, SyncEvent};
use clinichat_proto::message::{DeliveryState, Message, ParticipantId, Timestamp};
use clinichat_proto::push::Credential;
use clinichat_proto::scope::Universe;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("clinichat starting");

    let credential = config.credential().map_err(io::Error::other)?;
    let connector = RelayConnector::new(config.relay_url.clone(), config.relay_settings());
    let (mut connection, connection_events) =
        ConnectionManager::new(connector, config.channel_capacity);

    let identity = match connection.open(credential.clone()).await {
        Ok(_) => connection.identity().cloned(),
        Err(e) => {
            eprintln!("Could not connect to {} ({e})", config.relay_url);
            None
        }
    };
    let identity = match (identity, &credential) {
        (Some(id), _) => id,
        (None, Credential::Guest(id)) => {
            println!("Running offline as {id}; use /reconnect to retry");
            id.clone()
        }
        (None, Credential::Token(_)) => {
            return Err(io::Error::other("staff sign-in needs a reachable backend"));
        }
    };

    let gateway = Arc::new(
        HttpGateway::new(
            &config.api_url,
            config.token.clone(),
            config.request_timeout,
        )
        .map_err(io::Error::other)?,
    );
    let persistence =
        Arc::new(FilePersistence::new(&config.session_dir).map_err(io::Error::other)?);
    let engines = client::universes_for(&identity).iter().map(|universe| {
        ConversationSync::new(
            identity.clone(),
            *universe,
            Arc::clone(&gateway),
            Arc::clone(&persistence),
            SystemClock,
            config.sync.clone(),
        )
    });

    let mut client = Client::new(identity.clone(), credential, connection, engines);
    client.start().await;
    let universe = client
        .universes()
        .find(|u| *u == config.universe)
        .unwrap_or(Universe::Guest);

    let (commands, updates, handle) = client::spawn_client(
        client,
        connection_events,
        config.tick_interval,
        config.channel_capacity,
    );

    println!("Signed in as {identity}. Type /list to see conversations.");
    let _ = commands.send(ClientCommand::List { universe }).await;

    let result = run_repl(&identity, universe, &commands, updates).await;

    let _ = commands.send(ClientCommand::Shutdown).await;
    let _ = handle.await;
    tracing::info!("clinichat exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("clinichat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// What the user typed.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(ClientCommand),
    Say(String),
    Quit,
    Help,
    Nothing,
}

fn parse_input(line: &str, default_universe: Universe) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Nothing);
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (to, body) = rest.split_once(' ').ok_or("usage: @<id> <message>")?;
        return Ok(Input::Command(ClientCommand::Send {
            to: ParticipantId::new(to),
            body: body.trim().to_string(),
        }));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Say(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let input = match (parts.next(), parts.next()) {
        (Some("quit" | "q"), _) => Input::Quit,
        (Some("help" | "h"), _) => Input::Help,
        (Some("list" | "ls"), universe) => Input::Command(ClientCommand::List {
            universe: match universe {
                Some(name) => name.parse::<Universe>().map_err(|e| e.to_string())?,
                None => default_universe,
            },
        }),
        (Some("open"), Some(id)) => Input::Command(ClientCommand::Open {
            counterpart: ParticipantId::new(id),
        }),
        (Some("open"), None) => return Err("usage: /open <id>".to_string()),
        (Some("close"), _) => Input::Command(ClientCommand::Close),
        (Some("refresh"), _) => Input::Command(ClientCommand::Refresh),
        (Some("reconnect"), _) => Input::Command(ClientCommand::Reconnect),
        (Some(other), _) => return Err(format!("unknown command /{other}; try /help")),
        (None, _) => Input::Nothing,
    };
    Ok(input)
}

const HELP: &str = "\
/list [guest|internal]  show conversations
/open <id>              open a conversation
/close                  leave the open conversation
/refresh                reload rosters and unread counts
/reconnect              re-open the push channel
@<id> <text>            send a message
<text>                  send to the open conversation
/quit                   exit";

async fn run_repl(
    me: &ParticipantId,
    default_universe: Universe,
    commands: &mpsc::Sender<ClientCommand>,
    mut updates: mpsc::Receiver<ClientUpdate>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open: Option<ParticipantId> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let command = match parse_input(&line, default_universe) {
                    Ok(Input::Quit) => return Ok(()),
                    Ok(Input::Help) => {
                        println!("{HELP}");
                        continue;
                    }
                    Ok(Input::Nothing) => continue,
                    Ok(Input::Say(body)) => match &open {
                        Some(to) => ClientCommand::Send { to: to.clone(), body },
                        None => {
                            println!("No conversation open; use /open <id> or @<id> <text>");
                            continue;
                        }
                    },
                    Ok(Input::Command(command)) => command,
                    Err(usage) => {
                        println!("{usage}");
                        continue;
                    }
                };
                match &command {
                    ClientCommand::Open { counterpart } => open = Some(counterpart.clone()),
                    ClientCommand::Close => open = None,
                    _ => {}
                }
                if commands.send(command).await.is_err() {
                    println!("Client stopped");
                    return Ok(());
                }
            }
            update = updates.recv() => {
                let Some(update) = update else { return Ok(()) };
                render_update(me, open.as_ref(), &update);
            }
        }
    }
}

fn render_update(me: &ParticipantId, open: Option<&ParticipantId>, update: &ClientUpdate) {
    match update {
        ClientUpdate::Sync { event, .. } => match event {
            SyncEvent::MessageAdded {
                counterpart,
                message,
            } => {
                if open == Some(counterpart) {
                    println!("{}", render_message(me, message));
                } else if message.sender_id != *me {
                    println!("New message from {counterpart} (/open {counterpart})");
                }
            }
            SyncEvent::StatusChanged {
                counterpart,
                key,
                state,
            } if open == Some(counterpart) && key.sender_id == *me => {
                println!(
                    "  {} your message from {} is {state:?}",
                    state.symbol(),
                    format_timestamp(key.timestamp)
                );
            }
            SyncEvent::HistoryLoaded { counterpart, added } if *added > 0 => {
                tracing::debug!(counterpart = %counterpart, added, "history shown on open");
            }
            _ => {}
        },
        ClientUpdate::Conversations {
            universe,
            conversations,
        } => {
            println!("-- {universe} conversations --");
            if conversations.is_empty() {
                println!("  (none)");
            }
            for summary in conversations {
                println!("{}", render_summary(summary));
            }
        }
        ClientUpdate::Opened {
            counterpart,
            messages,
        } => {
            println!("-- {counterpart} --");
            for message in messages {
                println!("{}", render_message(me, message));
            }
        }
        ClientUpdate::Connection { connected, detail } => {
            if *connected {
                println!("Connected ({detail})");
            } else {
                println!("Disconnected: {detail}; use /reconnect");
            }
        }
        ClientUpdate::Error(e) => println!("Error: {e}"),
    }
}

fn render_message(me: &ParticipantId, message: &Message) -> String {
    let who = if message.sender_id == *me {
        "you"
    } else {
        message.sender_id.as_str()
    };
    format!(
        "[{}] {who}: {} {}",
        format_timestamp(message.timestamp),
        message.body,
        DeliveryState::of(message, me).symbol()
    )
}

fn render_summary(summary: &ConversationSummary) -> String {
    let unread = if summary.unread_count > 0 {
        format!(" ({} unread)", summary.unread_count)
    } else {
        String::new()
    };
    let last = summary.last_message.as_ref().map_or_else(String::new, |m| {
        format!(" [{}] {}", format_timestamp(m.timestamp), m.body)
    });
    format!(
        "  {} <{}>{unread}{last}",
        summary.display_name, summary.counterpart_id
    )
}

/// Format a timestamp as local "HH:MM".
fn format_timestamp(ts: Timestamp) -> String {
    use chrono::{Local, TimeZone};
    let ms = ts.as_millis();
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
        _ => "??:??".to_string(),
    }
}
