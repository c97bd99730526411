use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hafa_chat_lib::api::transport::TransportClient;
use hafa_chat_lib::api::{Attachment, Mode};
use hafa_chat_lib::commands::chat::{ChatController, ChatEvent, Turn, TurnOutcome};
use hafa_chat_lib::config::ClientConfig;
use hafa_chat_lib::db::Database;
use hafa_chat_lib::identity::{Anonymous, IdentityProvider, StaticIdentity};
use hafa_chat_lib::pending::PendingRegistry;
use hafa_chat_lib::session::SessionStore;

#[derive(Parser)]
#[command(name = "hafa-chat", about = "Ask the Håfa tutor from the terminal")]
struct Cli {
    /// Message to send
    message: String,

    /// Tutor mode: english, chamorro or learn
    #[arg(long)]
    mode: Option<Mode>,

    /// Override the API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Wait for the whole answer instead of streaming it
    #[arg(long)]
    once: bool,

    /// Attach a file (repeatable)
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Bearer token for a signed-in user
    #[arg(long, env = "HAFA_TOKEN")]
    token: Option<String>,

    /// External user id that goes with the token
    #[arg(long, env = "HAFA_USER_ID", default_value = "")]
    user_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    hafa_chat_lib::init_tracing();
    let cli = Cli::parse();

    let data_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hafa-chat");
    let db = Arc::new(Database::new(&data_dir)?);

    let mut config = ClientConfig::load(&db);
    if let Some(url) = cli.base_url {
        config = ClientConfig {
            default_mode: config.default_mode,
            ..ClientConfig::new(url)
        };
    }
    let mode = cli.mode.unwrap_or(config.default_mode);

    let identity: Arc<dyn IdentityProvider> = match cli.token {
        Some(token) => Arc::new(StaticIdentity::new(token, cli.user_id)),
        None => Arc::new(Anonymous),
    };

    let mut attachments = Vec::new();
    for path in &cli.files {
        attachments.push(Attachment::from_path(path).await?);
    }

    let controller = Arc::new(ChatController::new(
        TransportClient::new(config, identity),
        Arc::new(SessionStore::new(db)),
        Arc::new(PendingRegistry::new()),
    ));
    let turn = Turn::new(cli.message, mode).with_attachments(attachments);

    let interrupt = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    if cli.once {
        let result = controller.send_once(turn).await?;
        println!("{}", result.response);
        return Ok(());
    }

    let outcome = controller
        .send(turn, |event| {
            let mut stdout = std::io::stdout();
            match event {
                ChatEvent::Chunk { delta, .. } => {
                    let _ = write!(stdout, "{}", delta);
                    let _ = stdout.flush();
                }
                ChatEvent::Done { response_time, .. } => {
                    let _ = writeln!(stdout);
                    eprintln!("({:.2}s)", response_time);
                }
                ChatEvent::Cancelled { .. } => {
                    let _ = writeln!(stdout);
                    eprintln!("Message cancelled");
                }
                ChatEvent::Error { message } => eprintln!("Error: {}", message),
                ChatEvent::Metadata { .. } => {}
            }
        })
        .await;

    if outcome == TurnOutcome::Failed {
        std::process::exit(1);
    }
    Ok(())
}
