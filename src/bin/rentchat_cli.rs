use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use rentchat::{
    ChatConfig, ChatSession, HistoryState, HttpChatApi, Message, ReconcileOutcome,
    SessionCredentials, SessionUpdate, TokenStore, UserId, WebSocketConnector,
};

/// Terminal client for a single rentchat conversation
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a conversation and chat from stdin
    Chat {
        /// The other participant
        #[clap(long, value_name = "USER_ID")]
        peer: String,

        /// Our own user id, also the token store account
        #[clap(long, value_name = "USER_ID")]
        user: Option<String>,

        /// Bearer token; read from the token store when omitted
        #[clap(long, env = "RENTCHAT_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Keep tokens in a file under the data directory instead of the keyring
        #[clap(long)]
        file_store: bool,
    },

    /// Save a bearer token for an account
    StoreToken {
        #[clap(long, value_name = "USER_ID")]
        account: String,

        #[clap(long)]
        token: String,

        #[clap(long)]
        file_store: bool,
    },

    /// Delete the saved token of an account
    ForgetToken {
        #[clap(long, value_name = "USER_ID")]
        account: String,

        #[clap(long)]
        file_store: bool,
    },
}

fn token_store(config: &ChatConfig, file_store: bool) -> TokenStore {
    if file_store {
        TokenStore::file_backed(&config.data_dir)
    } else {
        TokenStore::for_platform(&config.data_dir)
    }
}

fn print_message(message: &Message) {
    let marker = if message.is_provisional() { "…" } else { " " };
    println!(
        "{} [{}] {}: {}",
        marker,
        message.timestamp.format("%H:%M"),
        message.sender_id,
        message.content
    );
}

async fn chat(
    config: ChatConfig,
    peer: String,
    user: Option<String>,
    token: Option<String>,
    file_store: bool,
) -> Result<()> {
    let token = match (token, user.as_deref()) {
        (Some(token), _) => Some(token),
        (None, Some(user)) => match token_store(&config, file_store).get_token(user) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(
                    target: "rentchat::cli::chat",
                    "No stored token for {}: {}",
                    user,
                    e
                );
                None
            }
        },
        (None, None) => None,
    };

    let api = match token.as_deref() {
        Some(token) => Arc::new(HttpChatApi::new(&config, token)?),
        None => anyhow::bail!("no token given and none stored; use --token or store-token"),
    };

    let mut session = ChatSession::open(
        &config,
        SessionCredentials {
            token,
            peer_id: UserId::new(peer),
            local_user_id: user.map(UserId::new),
        },
        api,
        Arc::new(WebSocketConnector),
    )?;

    match session.load_peer_profile().await {
        Ok(profile) => println!("Chatting with {}", profile.display_name()),
        Err(e) => println!("Chatting with {} ({})", session.peer_id(), e),
    }
    println!("Type a message and press enter. /quit leaves.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim() == "/quit" {
                    break;
                }
                if let Some(pending) = session.send_message(&line)?
                    && let Some(message) = session.snapshot().find(|m| {
                        m.correlation_id() == Some(&pending.correlation_id)
                    })
                {
                    print_message(message);
                }
            }
            update = session.next_update() => {
                let Some(update) = update else { break };
                match update {
                    SessionUpdate::HistoryLoaded { .. } => {
                        session.snapshot().for_each(print_message);
                    }
                    SessionUpdate::HistoryFailed { reason } => {
                        println!("! could not load history: {reason}");
                    }
                    SessionUpdate::MessageReceived(ReconcileOutcome::Applied { slot, .. }) => {
                        if let Some(message) = session.snapshot().last() {
                            tracing::trace!(
                                target: "rentchat::cli::chat",
                                "Printing message at slot {}",
                                slot
                            );
                            print_message(message);
                        }
                    }
                    SessionUpdate::MessageReceived(ReconcileOutcome::Duplicate) => {}
                    SessionUpdate::RemoteTyping(true) => println!("  {} is typing…", session.peer_id()),
                    SessionUpdate::RemoteTyping(false) => {}
                    SessionUpdate::ConnectionChanged(status) => println!("  ({status:?})"),
                }
            }
        }
    }

    if *session.history_state() == HistoryState::Loading {
        tracing::debug!(target: "rentchat::cli::chat", "Leaving before history arrived");
    }
    session.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ChatConfig::from_env().context("failed to read configuration")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))?;
    rentchat::init_tracing(&config.logs_dir)?;

    let result = match args.command {
        Command::Chat {
            peer,
            user,
            token,
            file_store,
        } => chat(config, peer, user, token, file_store).await,
        Command::StoreToken {
            account,
            token,
            file_store,
        } => token_store(&config, file_store)
            .store_token(&account, &token)
            .map_err(Into::into),
        Command::ForgetToken {
            account,
            file_store,
        } => token_store(&config, file_store)
            .remove_token(&account)
            .map_err(Into::into),
    };

    rentchat::flush_tracing();
    result
}
