use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Read model of the external identity provider, refreshed from
        -- validated token claims on every authenticated request.
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL,
            avatar_url    TEXT,
            last_seen_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Exactly one conversation per unordered participant pair:
        -- pair_key is the two user ids sorted and joined with '_', and the
        -- UNIQUE constraint is the sole duplicate-prevention mechanism.
        CREATE TABLE IF NOT EXISTS conversations (
            id               TEXT PRIMARY KEY,
            user_a           TEXT NOT NULL,
            user_b           TEXT NOT NULL,
            pair_key         TEXT NOT NULL UNIQUE,
            last_message_id  TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK (user_a <> user_b)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL,
            text             TEXT NOT NULL,
            seen             INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );

        -- Ordered history scans
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- Unread aggregation
        CREATE INDEX IF NOT EXISTS idx_messages_unseen
            ON messages(conversation_id, sender_id, seen);

        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations(updated_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
