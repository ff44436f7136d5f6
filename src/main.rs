use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use chatsync::cache::TtlCache;
use chatsync::chat::ChatClient;
use chatsync::config::Config;
use chatsync::query::Query;
use chatsync::source::RestSource;
use chatsync::ConversationHint;

#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(about = "Messaging client for the platform's data API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chatsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List conversations, most recent first
  Conversations,
  /// Send a direct message
  Send {
    /// Recipient user id
    #[arg(long)]
    to: Uuid,
    /// Message body
    #[arg(long)]
    message: String,
  },
  /// Open a thread for a counterpart with no history yet
  Open {
    /// Counterpart user id
    #[arg(long)]
    with: Uuid,
  },
  /// Follow a thread live, printing messages as they arrive
  Watch {
    /// Counterpart user id
    #[arg(long)]
    with: Uuid,
  },
  /// Mark all messages from a counterpart as read
  MarkRead {
    /// Counterpart user id
    #[arg(long)]
    with: Uuid,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let source = Arc::new(RestSource::new(
    &config.backend.url,
    config.tuning.poll_interval(),
  )?);

  let reference = match TtlCache::persistent() {
    Ok(cache) => cache,
    Err(e) => {
      warn!(error = %e, "persistent cache unavailable, reference data will not survive restarts");
      TtlCache::in_memory()
    }
  };

  let client = Arc::new(
    ChatClient::new(source, config.user_id)
      .with_reference_cache(reference)
      .with_tunables(config.tuning.tunables()),
  );

  match args.command {
    Command::Conversations => conversations(&client).await,
    Command::Send { to, message } => send(&client, to, &message).await,
    Command::Open { with } => open(&client, with).await,
    Command::Watch { with } => watch(client, with).await,
    Command::MarkRead { with } => mark_read(&client, with).await,
  }
}

async fn conversations(client: &ChatClient) -> Result<()> {
  for conv in client.conversations().await? {
    let name = conv
      .full_name
      .or(conv.username)
      .unwrap_or_else(|| conv.user_id.to_string());
    let preview = conv.last_message.as_deref().unwrap_or("(no messages yet)");
    let presence = if conv.is_online { "online" } else { "offline" };
    println!(
      "{}  [{:>2} unread] [{}]  {}  {}",
      conv.last_message_time.format("%Y-%m-%d %H:%M"),
      conv.unread_count,
      presence,
      name,
      preview
    );
  }
  Ok(())
}

async fn send(client: &ChatClient, to: Uuid, message: &str) -> Result<()> {
  let sent = client.send_message(to, message).await?;
  println!("sent {} at {}", sent.id, sent.created_at.to_rfc3339());
  Ok(())
}

async fn open(client: &ChatClient, with: Uuid) -> Result<()> {
  let conv = client
    .register_conversation(ConversationHint::for_user(with))
    .await?;
  let name = conv
    .full_name
    .or(conv.username)
    .unwrap_or_else(|| with.to_string());
  println!("opened thread with {}", name);
  Ok(())
}

async fn mark_read(client: &ChatClient, with: Uuid) -> Result<()> {
  client.mark_read(with).await?;
  println!("marked messages from {} as read", with);
  Ok(())
}

async fn watch(client: Arc<ChatClient>, with: Uuid) -> Result<()> {
  let (mut transcript, mut subscription) = client.open_thread(with).await?;
  for message in transcript.messages() {
    print_message(client.user_id(), message);
  }

  // Conversation list refresh runs as a background query so a slow fetch
  // never stalls message delivery.
  let list_client = client.clone();
  let mut list = Query::new(move || {
    let client = list_client.clone();
    async move { client.conversations().await.map_err(|e| e.to_string()) }
  });
  list.fetch();

  let mut ticker = tokio::time::interval(Duration::from_millis(250));
  loop {
    tokio::select! {
      event = subscription.next() => {
        match event {
          Some(event) => {
            if transcript.apply_event(&event) {
              if let Some(message) = transcript.messages().last() {
                print_message(client.user_id(), message);
              }
              // Re-run the fetch-and-merge cycle off the fresh history.
              client.invalidate_conversations();
              list.refetch();
            }
          }
          None => break,
        }
      }
      _ = ticker.tick() => {
        if list.poll() {
          if let Some(conversations) = list.data() {
            info!(total = conversations.len(), "conversation list refreshed");
          } else if let Some(error) = list.error() {
            warn!(error, "conversation list refresh failed");
          }
        }
      }
    }
  }

  Ok(())
}

fn print_message(me: Uuid, message: &chatsync::Message) {
  let direction = if message.sender_id == me { "->" } else { "<-" };
  println!(
    "{} {} {}",
    message.created_at.format("%H:%M:%S"),
    direction,
    message.body
  );
}

/// File logging under the platform data dir; stdout stays reserved for
/// command output.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()?.join("chatsync").join("logs");
  std::fs::create_dir_all(&log_dir).ok()?;

  let appender = tracing_appender::rolling::daily(log_dir, "chatsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Some(guard)
}
