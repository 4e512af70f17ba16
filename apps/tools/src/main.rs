use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/client.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the database and run a trivial query.
    Check,
    /// Print what the client would resume with. Tokens are not shown.
    ShowSession,
    /// Forget the stored token pair and active conversation.
    ClearSession,
    /// Forget only the last active conversation.
    ClearActive,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::Check => {
            storage.health_check().await?;
            println!("ok: {}", cli.database_url);
        }
        Command::ShowSession => {
            match storage.load_token_pair().await? {
                Some(pair) => println!(
                    "session stored (updated_at={}, access_token_len={}, refresh_token_len={})",
                    pair.updated_at,
                    pair.access_token.len(),
                    pair.refresh_token.len()
                ),
                None => println!("no session stored"),
            }
            match storage.load_active_conversation().await? {
                Some(id) => println!("active_conversation_id={id}"),
                None => println!("no active conversation"),
            }
        }
        Command::ClearSession => {
            storage.clear_session().await?;
            println!("session cleared");
        }
        Command::ClearActive => {
            storage.clear_active_conversation().await?;
            println!("active conversation cleared");
        }
    }

    Ok(())
}
