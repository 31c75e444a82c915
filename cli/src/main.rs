use std::time::Duration;

use bin_realtime::{
    ActivityDraft, ActivityFeed, ActivityKind, ConfigError, ConnectError, ConnectionManager, Event, EventKind, Inbound,
    Participant, PresenceError, PresenceStatus, PresenceTracker, RealtimeConfig, SendError,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value, json};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("send rejected: {0}")]
    Send(#[from] SendError),
    #[error("presence update failed: {0}")]
    Presence(#[from] PresenceError),
    #[error("invalid envelope: {0}")]
    Codec(#[from] envelopes::CodecError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    PayloadNotObject,
    #[error("timed out after {0:?} waiting for queued envelopes to go out")]
    DrainTimeout(Duration),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "bin-live", about = "BIN marketplace realtime CLI")]
struct Cli {
    /// Realtime endpoint, e.g. `wss://live.example.com/ws`.
    #[arg(long, env = "BIN_RT_URL")]
    url: String,

    /// Seconds to wait for queued envelopes to go out before exiting.
    #[arg(long, default_value_t = 10)]
    drain_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print connection state, presence, and activity as JSON lines.
    Watch(WatchArgs),
    /// Announce presence until ctrl-c, then leave.
    Announce(AnnounceArgs),
    /// Broadcast one activity.
    Broadcast(BroadcastArgs),
    /// Send one envelope of any type.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Extra passthrough types to print, e.g. `--type chat`.
    #[arg(long = "type")]
    types: Vec<String>,
}

#[derive(Args, Debug)]
struct IdentityArgs {
    #[arg(long)]
    id: String,

    #[arg(long)]
    name: String,

    #[arg(long)]
    avatar: Option<String>,
}

impl IdentityArgs {
    fn participant(self) -> Participant {
        let participant = Participant::new(self.id, self.name);
        match self.avatar {
            Some(avatar) => participant.with_avatar(avatar),
            None => participant,
        }
    }
}

#[derive(Args, Debug)]
struct AnnounceArgs {
    #[command(flatten)]
    identity: IdentityArgs,

    #[arg(long, default_value = "online")]
    status: PresenceStatus,

    #[arg(long)]
    page: Option<String>,

    /// Seconds between printed rosters of online participants.
    #[arg(long, default_value_t = 10)]
    roster_every: u64,
}

#[derive(Args, Debug)]
struct BroadcastArgs {
    #[command(flatten)]
    identity: IdentityArgs,

    /// purchase, upload, join, or review.
    #[arg(long)]
    kind: ActivityKind,

    /// JSON object payload.
    #[arg(long)]
    data: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long = "type")]
    kind: String,

    /// JSON object payload.
    #[arg(long)]
    data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = RealtimeConfig::from_env_with_url(cli.url)?;
    let connection = ConnectionManager::new(config.connection.clone());
    let drain_timeout = Duration::from_secs(cli.drain_timeout);

    match cli.command {
        Command::Watch(args) => run_watch(&connection, args).await,
        Command::Announce(args) => run_announce(&connection, &config, args, drain_timeout).await,
        Command::Broadcast(args) => run_broadcast(&connection, &config, args, drain_timeout).await,
        Command::Send(args) => run_send(&connection, args, drain_timeout).await,
    }
}

async fn run_watch(connection: &ConnectionManager, args: WatchArgs) -> Result<(), CliError> {
    let mut states = connection.watch_state();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            print_line(&json!({ "event": "state", "state": state }));
        }
    });

    let mut kinds = vec![EventKind::Presence, EventKind::ParticipantLeft, EventKind::Activity];
    kinds.extend(args.types.iter().map(|kind| EventKind::from_wire(kind)));
    let subscriptions: Vec<_> = kinds.into_iter().map(|kind| connection.on(kind, print_inbound)).collect();

    if let Err(error) = connection.connect().await {
        warn!(%error, "watch: initial connect failed, retrying in the background");
    }
    tokio::signal::ctrl_c().await?;

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    connection.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run_announce(
    connection: &ConnectionManager,
    config: &RealtimeConfig,
    args: AnnounceArgs,
    drain_timeout: Duration,
) -> Result<(), CliError> {
    let tracker = PresenceTracker::new(connection.clone(), config.presence.clone());
    connection.connect().await?;

    let participant = args.identity.participant();
    let identity = participant.id.clone();
    tracker.announce_self(participant, args.status)?;
    if let Some(page) = args.page {
        tracker.set_current_page(page)?;
    }
    info!(%identity, "announce: present, ctrl-c to leave");

    let mut roster = tokio::time::interval(Duration::from_secs(args.roster_every.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = roster.tick() => {
                print_line(&json!({ "event": "online", "participants": tracker.online() }));
            }
        }
    }

    tracker.destroy();
    drain(connection, drain_timeout).await?;
    connection.shutdown().await;
    Ok(())
}

async fn run_broadcast(
    connection: &ConnectionManager,
    config: &RealtimeConfig,
    args: BroadcastArgs,
    drain_timeout: Duration,
) -> Result<(), CliError> {
    let payload = parse_payload(args.data.as_deref())?;
    let feed = ActivityFeed::new(connection.clone(), config.feed);
    connection.connect().await?;

    let draft = ActivityDraft::new(args.kind, args.identity.participant()).with_payload(payload);
    let record = feed.broadcast(draft)?;
    print_line(&serde_json::to_value(&record)?);

    drain(connection, drain_timeout).await?;
    connection.shutdown().await;
    Ok(())
}

async fn run_send(connection: &ConnectionManager, args: SendArgs, drain_timeout: Duration) -> Result<(), CliError> {
    let payload = parse_payload(args.data.as_deref())?;
    let event = Event::from_parts(&args.kind, payload)?;
    connection.connect().await?;
    connection.send(event)?;

    drain(connection, drain_timeout).await?;
    connection.shutdown().await;
    Ok(())
}

/// Wait until the outbound queue is empty.
async fn drain(connection: &ConnectionManager, limit: Duration) -> Result<(), CliError> {
    let drained = timeout(limit, async {
        while connection.queued_len() > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    drained.map_err(|_| CliError::DrainTimeout(limit))
}

fn parse_payload(data: Option<&str>) -> Result<Value, CliError> {
    let Some(text) = data else {
        return Ok(Value::Object(Map::new()));
    };
    match serde_json::from_str::<Value>(text)? {
        object @ Value::Object(_) => Ok(object),
        _ => Err(CliError::PayloadNotObject),
    }
}

fn print_inbound(inbound: &Inbound) {
    let (kind, payload) = inbound.event.clone().into_parts();
    print_line(&json!({
        "event": kind,
        "origin": inbound.origin_session_id,
        "timestamp": inbound.timestamp,
        "payload": payload,
    }));
}

fn print_line(value: &Value) {
    println!("{value}");
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
