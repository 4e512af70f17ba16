use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatClient, Conversation, ConversationEvent};
use shared::{domain::ConversationId, protocol::MessagePayload};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the group chat service")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    /// Logs in when no stored session can be resumed.
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Conversation to open and print.
    #[arg(long)]
    open: Option<i64>,
    /// Send a message to the opened conversation.
    #[arg(long, requires = "open")]
    say: Option<String>,
    /// Keep running and print pushed messages until Ctrl-C.
    #[arg(long)]
    follow: bool,
    /// End the stored session and exit.
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if let Some(push_url) = args.push_url {
        settings.push_url = Some(push_url);
    }

    let client = ChatClient::connect(settings).await?;
    let resumed = client
        .restore_session()
        .await
        .context("failed to resume stored session")?;

    if args.logout {
        if resumed {
            client.logout().await;
            println!("logged out");
        } else {
            println!("no stored session");
        }
        return Ok(());
    }

    if !resumed {
        let (Some(username), Some(password)) = (args.username, args.password) else {
            bail!("no stored session; pass --username and --password");
        };
        client.login(&username, &password).await.context("login failed")?;
        println!("logged in as {username}");
    }

    for conversation in client.store().sorted_conversations().await {
        print_conversation(&conversation);
    }

    let mut printed = HashSet::new();
    if let Some(id) = args.open.map(ConversationId) {
        client
            .store()
            .set_active_conversation(id)
            .await
            .with_context(|| format!("failed to open conversation {id}"))?;
        print_new_messages(&client, &mut printed).await;

        if let Some(text) = args.say {
            client.store().send_message(&text).await.context("send failed")?;
        }
    }

    if args.follow {
        follow(&client, &mut printed).await?;
    }
    Ok(())
}

async fn follow(client: &ChatClient, printed: &mut HashSet<i64>) -> Result<()> {
    let mut events = client.store().subscribe();
    client.start_push().await.context("failed to open push channel")?;
    println!("following; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConversationEvent::MessagesChanged(id)) => {
                    if client.store().active_conversation_id().await == Some(id) {
                        print_new_messages(client, printed).await;
                    }
                }
                Ok(ConversationEvent::ConversationUpdated(id)) => {
                    if let Some(conversation) = client.store().conversation(id).await {
                        print_conversation(&conversation);
                    }
                }
                Ok(ConversationEvent::ConversationRemoved(id)) => println!("conversation {id} removed"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: missed conversation events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.stop_push().await;
    Ok(())
}

fn print_conversation(conversation: &Conversation) {
    let last = conversation
        .last_message_time
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into());
    let muted = if conversation.muted { " (muted)" } else { "" };
    println!(
        "{:>6}  {:<24} unread={:<4} last={}{}",
        conversation.id, conversation.name, conversation.unread_count, last, muted
    );
}

async fn print_new_messages(client: &ChatClient, printed: &mut HashSet<i64>) {
    for message in client.store().active_messages().await {
        if printed.insert(message.id.0) {
            print_message(&message);
        }
    }
}

fn print_message(message: &MessagePayload) {
    let sender = message
        .sender_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "system".into());
    println!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        sender,
        message.content
    );
}
