use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::ChannelId;
use storage::{SessionStore, StateStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/bot.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the stored update position of every channel.
    Positions,
    /// Forget one channel's position so the bot resyncs it.
    Reset {
        #[arg(long)]
        channel: i64,
    },
    /// Clear the persisted login session.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Positions => {
            let positions = storage.positions().await?;
            if positions.is_empty() {
                println!("no stored positions");
            }
            for position in positions {
                let label = if position.channel_id.is_common() {
                    "common".to_string()
                } else {
                    format!("channel {}", position.channel_id)
                };
                println!("{label}: pts={} date={}", position.pts, position.date.to_rfc3339());
            }
            match storage.load_session().await? {
                Some(session) => println!(
                    "session: user_id={} bot={} username={}",
                    session.user_id,
                    session.is_bot,
                    session.username.as_deref().unwrap_or("-")
                ),
                None => println!("session: none"),
            }
        }
        Command::Reset { channel } => {
            storage.forget(ChannelId(channel)).await?;
            println!("forgot position of channel {channel}");
        }
        Command::Logout => {
            storage.clear_session().await?;
            println!("persisted session cleared");
        }
    }

    Ok(())
}
