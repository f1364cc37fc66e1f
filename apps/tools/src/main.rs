use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use shared::domain::{ConversationId, UserId};
use storage::{NewMessage, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/socialvibe.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create users that do not exist yet and print their ids.
    CreateUsers {
        #[arg(required = true)]
        usernames: Vec<String>,
    },
    /// Find or create the direct conversation between two users.
    CreateDirect { user_a: i64, user_b: i64 },
    CreateGroup {
        #[arg(long)]
        name: Option<String>,
        #[arg(required = true)]
        participants: Vec<i64>,
    },
    /// Insert a message as `sender` without going through the server.
    SeedMessage {
        conversation_id: i64,
        sender: i64,
        content: String,
    },
    /// Mint a bearer token the server accepts for `user_id`.
    MintToken {
        user_id: i64,
        #[arg(long, env = "APP__JWT_SECRET", default_value = "socialvibe-dev-secret")]
        secret: String,
        #[arg(long, default_value_t = 3600)]
        ttl_seconds: i64,
    },
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUsers { usernames } => {
            for username in usernames {
                let user_id = storage.create_user(username.trim()).await?;
                println!("{username}\tuser_id={}", user_id.0);
            }
        }
        Command::CreateDirect { user_a, user_b } => {
            if user_a == user_b {
                bail!("a direct conversation needs two different users");
            }
            let conversation_id = storage
                .find_or_create_direct_conversation(UserId(user_a), UserId(user_b))
                .await?;
            println!("conversation_id={}", conversation_id.0);
        }
        Command::CreateGroup { name, participants } => {
            if participants.len() < 2 {
                bail!("a group needs at least two participants");
            }
            let participants: Vec<UserId> = participants.into_iter().map(UserId).collect();
            let conversation_id = storage
                .create_group_conversation(name.as_deref(), None, &participants)
                .await?;
            println!("conversation_id={}", conversation_id.0);
        }
        Command::SeedMessage {
            conversation_id,
            sender,
            content,
        } => {
            let conversation_id = ConversationId(conversation_id);
            let sender_id = UserId(sender);
            if !storage.is_participant(conversation_id, sender_id).await? {
                bail!("user {sender} is not a participant of conversation {}", conversation_id.0);
            }
            let message = storage
                .insert_message(NewMessage {
                    conversation_id,
                    sender_id,
                    content,
                    media: None,
                    reply_to: None,
                    client_nonce: None,
                })
                .await?;
            println!("message_id={}", message.message_id.0);
        }
        Command::MintToken {
            user_id,
            secret,
            ttl_seconds,
        } => {
            let username = storage
                .username_for_user(UserId(user_id))
                .await?
                .with_context(|| format!("user {user_id} not found"))?;
            let now = Utc::now();
            let claims = Claims {
                sub: user_id.to_string(),
                name: username,
                iat: now.timestamp(),
                exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
            };
            let token = encode(
                &Header::new(Algorithm::HS256),
                &claims,
                &EncodingKey::from_secret(secret.as_bytes()),
            )?;
            println!("{token}");
        }
    }

    Ok(())
}
