use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ClientNonce, ConversationId, ConversationKind, MediaRef, MessageId, UserId},
    protocol::{Conversation, Message, MessagePreview, Reaction, ReadReceipt},
};

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, u.username, m.content, m.media_json, m.reply_to, m.client_nonce, m.edited, m.deleted, m.created_at, m.edited_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media: Option<MediaRef>,
    pub reply_to: Option<MessageId>,
    pub client_nonce: Option<ClientNonce>,
}

/// Current time at the precision that survives a JSON round trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every pooled connection to an in-memory URL would open its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn find_or_create_direct_conversation(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<ConversationId> {
        let (low, high) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        let direct_key = format!("{}:{}", low.0, high.0);

        if let Some(row) = sqlx::query("SELECT id FROM conversations WHERE direct_key = ?")
            .bind(&direct_key)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(ConversationId(row.get::<i64, _>(0)));
        }

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, direct_key, last_activity_at) VALUES ('direct', ?, ?) RETURNING id",
        )
        .bind(&direct_key)
        .bind(now())
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));
        for (position, user_id) in [first, second].into_iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, position) VALUES (?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn create_group_conversation(
        &self,
        name: Option<&str>,
        avatar_url: Option<&str>,
        participants: &[UserId],
    ) -> Result<ConversationId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, name, avatar_url, last_activity_at) VALUES ('group', ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(avatar_url)
        .bind(now())
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));
        for (position, user_id) in participants.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, position) VALUES (?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY position ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, kind, name, avatar_url, last_message_id, last_activity_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.conversation_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    /// Conversations of `user_id`, most recently active first. Returns the page and
    /// whether another page follows.
    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Conversation>, bool)> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.name, c.avatar_url, c.last_message_id, c.last_activity_at
             FROM conversations c
             INNER JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.last_activity_at DESC, c.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id.0)
        .bind(i64::from(limit) + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_next = rows.len() > limit as usize;
        let mut conversations = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            conversations.push(self.conversation_from_row(row).await?);
        }
        Ok((conversations, has_next))
    }

    pub async fn insert_message(&self, new_message: NewMessage) -> Result<Message> {
        let created_at = now();
        let media_json = new_message
            .media
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode media reference")?;

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, media_json, reply_to, client_nonce, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(new_message.conversation_id.0)
        .bind(new_message.sender_id.0)
        .bind(&new_message.content)
        .bind(media_json)
        .bind(new_message.reply_to.map(|id| id.0))
        .bind(new_message.client_nonce.map(|nonce| nonce.to_string()))
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        sqlx::query("UPDATE conversations SET last_message_id = ?, last_activity_at = ? WHERE id = ?")
            .bind(message_id.0)
            .bind(created_at)
            .bind(new_message.conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {} vanished after insert", message_id.0))
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m INNER JOIN users u ON u.id = m.sender_id WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let mut message = message_from_row(&row)?;
                message.reactions = self.reactions_for(message.message_id).await?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// History newest first, skipping messages `viewer` deleted for themselves.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Message>, bool)> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ?
               AND NOT EXISTS (SELECT 1 FROM hidden_messages h WHERE h.message_id = m.id AND h.user_id = ?)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(conversation_id.0)
        .bind(viewer.0)
        .bind(i64::from(limit) + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_next = rows.len() > limit as usize;
        let mut messages = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            let mut message = message_from_row(row)?;
            message.reactions = self.reactions_for(message.message_id).await?;
            messages.push(message);
        }
        Ok((messages, has_next))
    }

    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<Message> {
        sqlx::query("UPDATE messages SET content = ?, edited = 1, edited_at = ? WHERE id = ? AND deleted = 0")
            .bind(content)
            .bind(now())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        self.message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {} not found", message_id.0))
    }

    pub async fn tombstone_message(&self, message_id: MessageId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET deleted = 1, content = '', media_json = NULL WHERE id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM message_reactions WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn hide_message_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO hidden_messages (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One reaction per (message, user); a second reaction overwrites the first.
    pub async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<Reaction> {
        let created_at = now();
        sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET emoji=excluded.emoji, created_at=excluded.created_at",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(Reaction {
            user_id,
            emoji: emoji.to_string(),
            created_at,
        })
    }

    pub async fn remove_reaction(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks everything currently in the conversation as read by `user_id`.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<ReadReceipt> {
        let up_to = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT last_message_id FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?
        .flatten()
        .map(MessageId);
        self.record_read_marker(conversation_id, user_id, up_to).await
    }

    pub async fn record_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        up_to: Option<MessageId>,
    ) -> Result<ReadReceipt> {
        let read_at = now();
        sqlx::query(
            "INSERT INTO read_markers (conversation_id, user_id, up_to_message_id, read_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                up_to_message_id = MAX(COALESCE(read_markers.up_to_message_id, 0), COALESCE(excluded.up_to_message_id, 0)),
                read_at = excluded.read_at",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(up_to.map(|id| id.0))
        .bind(read_at)
        .execute(&self.pool)
        .await?;
        Ok(ReadReceipt {
            conversation_id,
            reader_id: user_id,
            up_to,
            read_at,
        })
    }

    pub async fn read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ReadReceipt>> {
        let row = sqlx::query(
            "SELECT up_to_message_id, read_at FROM read_markers WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ReadReceipt {
            conversation_id,
            reader_id: user_id,
            up_to: r
                .get::<Option<i64>, _>(0)
                .filter(|id| *id > 0)
                .map(MessageId),
            read_at: r.get::<DateTime<Utc>, _>(1),
        }))
    }

    async fn reactions_for(&self, message_id: MessageId) -> Result<Vec<Reaction>> {
        let rows = sqlx::query(
            "SELECT user_id, emoji, created_at FROM message_reactions WHERE message_id = ? ORDER BY created_at ASC, user_id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Reaction {
                user_id: UserId(r.get::<i64, _>(0)),
                emoji: r.get::<String, _>(1),
                created_at: r.get::<DateTime<Utc>, _>(2),
            })
            .collect())
    }

    async fn conversation_from_row(&self, row: &SqliteRow) -> Result<Conversation> {
        let conversation_id = ConversationId(row.try_get::<i64, _>("id")?);
        let kind_raw: String = row.try_get("kind")?;
        let kind = ConversationKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown conversation kind '{kind_raw}'"))?;
        let last_message = match row.try_get::<Option<i64>, _>("last_message_id")? {
            Some(id) => self
                .message(MessageId(id))
                .await?
                .map(|message| MessagePreview::from(&message)),
            None => None,
        };
        Ok(Conversation {
            conversation_id,
            kind,
            participant_ids: self.participants(conversation_id).await?,
            name: row.try_get("name")?,
            avatar_url: row.try_get("avatar_url")?,
            last_message,
            last_activity_at: row.try_get("last_activity_at")?,
        })
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let media = row
        .try_get::<Option<String>, _>("media_json")?
        .map(|raw| serde_json::from_str::<MediaRef>(&raw))
        .transpose()
        .context("stored media reference is corrupt")?;
    let client_nonce = row
        .try_get::<Option<String>, _>("client_nonce")?
        .and_then(|raw| raw.parse().ok())
        .map(ClientNonce);
    Ok(Message {
        message_id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        sender_username: row.try_get("username")?,
        content: row.try_get("content")?,
        media,
        reply_to: row.try_get::<Option<i64>, _>("reply_to")?.map(MessageId),
        reactions: Vec::new(),
        edited: row.try_get("edited")?,
        deleted: row.try_get("deleted")?,
        client_nonce,
        created_at: row.try_get("created_at")?,
        edited_at: row.try_get("edited_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
