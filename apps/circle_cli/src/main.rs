use std::{collections::HashSet, path::PathBuf};

use anyhow::{Context, Result};
use circle_client::{
    load_settings, CircleClient, ClientEvent, Credentials, LocalId, Message, MessageOrigin,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file; `circles.toml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long, default_value = "")]
    token: String,
    /// Circle to join on startup.
    #[arg(long)]
    circle: Option<String>,
    #[arg(long)]
    interest: Option<String>,
    /// Send every message under the anonymous alias.
    #[arg(long)]
    anonymous: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    let display_name = args.display_name.clone().unwrap_or_else(|| args.user_id.clone());
    let credentials = Credentials::new(args.user_id.as_str(), display_name, args.token.as_str());
    let client = CircleClient::new(settings, credentials).context("failed to build circle client")?;

    if let Err(err) = client.connect().await {
        if err.is_auth() {
            return Err(err).context("server rejected credentials");
        }
        warn!(%err, "realtime connection unavailable, continuing offline");
    }

    print_circles(&client, args.interest.as_deref()).await;
    if let Some(circle) = args.circle.as_deref() {
        join(&client, circle).await;
    }

    let timeline_printer = tokio::spawn(print_timeline(WatchStream::new(client.watch_timeline())));
    let event_printer = tokio::spawn(print_events(client.subscribe_events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "/quit" => break,
            "/leave" => client.leave().await,
            "/join" => join(&client, rest.trim()).await,
            "/circles" => print_circles(&client, Some(rest.trim()).filter(|s| !s.is_empty())).await,
            "/retry" => match rest.trim().parse::<u64>() {
                Ok(id) => {
                    if let Err(err) = client.retry(LocalId(id)).await {
                        println!("! retry failed: {err}");
                    }
                }
                Err(_) => println!("! usage: /retry <local id number>"),
            },
            "/typing" => {
                let is_typing = rest.trim() != "off";
                if let Err(err) = client.set_typing(is_typing).await {
                    println!("! {err}");
                }
            }
            _ => {
                if let Err(err) = client.send_message(line, args.anonymous).await {
                    println!("! {err}");
                }
            }
        }
    }

    client.disconnect().await;
    timeline_printer.abort();
    event_printer.abort();
    Ok(())
}

async fn join(client: &CircleClient, circle: &str) {
    if circle.is_empty() {
        println!("! usage: /join <circle id>");
        return;
    }
    match client.join(circle).await {
        Ok(membership) => println!(
            "* joined {} ({:?}, {} online)",
            membership.circle_id, membership.mode, membership.online_count
        ),
        Err(err) => println!("! could not join {circle}: {err}"),
    }
}

async fn print_circles(client: &CircleClient, interest: Option<&str>) {
    for circle in client.list_circles(interest).await {
        println!(
            "  [{}] {} #{} {}/{} members, {} online",
            circle.id,
            circle.name,
            circle.interest_tag,
            circle.member_count,
            circle.max_members,
            circle.online_count
        );
    }
}

async fn print_timeline(
    mut snapshots: WatchStream<std::sync::Arc<circle_client::TimelineSnapshot>>,
) {
    let mut printed: HashSet<(u64, LocalId, MessageOrigin)> = HashSet::new();
    while let Some(snapshot) = snapshots.next().await {
        for message in &snapshot.messages {
            if printed.insert((snapshot.epoch, message.local_id, message.origin)) {
                println!("{}", render(message));
            }
        }
    }
}

fn render(message: &Message) -> String {
    let marker = match message.origin {
        MessageOrigin::LocalPending => " (sending)",
        MessageOrigin::SendFailed => " (failed, /retry to resend)",
        MessageOrigin::LocalConfirmed | MessageOrigin::Remote if message.is_seed => " (demo)",
        MessageOrigin::LocalConfirmed | MessageOrigin::Remote => "",
    };
    format!(
        "{} [{}] {}: {}{}",
        message.local_id.0,
        message.sort_key().0.format("%H:%M:%S"),
        message.display_name,
        message.body,
        marker
    )
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::ConnectionStateChanged(state)) => println!("* connection {state:?}"),
            Ok(ClientEvent::ConnectionLost { attempts }) => {
                println!("! connection lost after {attempts} attempts")
            }
            Ok(ClientEvent::JoinRejected { error, seed }) => {
                println!("! {error}");
                for message in &seed {
                    println!("  {}", render(message));
                }
            }
            Ok(ClientEvent::SendFailed { local_id, error }) => {
                println!("! message {} not delivered: {error}", local_id.0)
            }
            Ok(ClientEvent::PresenceChanged(presence)) => {
                if let Some(circle_id) = presence.circle_id {
                    println!("* {} online in {circle_id}", presence.online_count);
                    if !presence.typing.is_empty() {
                        println!("* {} typing...", presence.typing.join(", "));
                    }
                }
            }
            Ok(ClientEvent::ServerError(error)) => println!("! server: {error}"),
            Ok(ClientEvent::MembershipChanged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
