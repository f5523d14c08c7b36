use crate::Database;
use crate::models::{ConversationRow, ConversationSummaryRow, MessageRow};
use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use uuid::Uuid;

/// Normalized lookup key for an unordered participant pair: the two ids
/// sorted lexicographically and joined with '_'. Order-independent by
/// construction.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

/// RFC 3339 UTC with fixed microsecond precision, so lexicographic order
/// on the stored text equals chronological order.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    // -- Users --

    /// Refresh the identity read model from validated token claims.
    pub fn upsert_user(&self, id: &str, username: &str, avatar_url: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, avatar_url, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     username = excluded.username,
                     avatar_url = excluded.avatar_url,
                     last_seen_at = excluded.last_seen_at",
                rusqlite::params![id, username, avatar_url, now_ts()],
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Find the conversation for an unordered pair, creating it if absent.
    /// The UNIQUE(pair_key) constraint makes concurrent callers converge on
    /// a single row: an insert that conflicts is a no-op and the follow-up
    /// read returns the winner.
    pub fn get_or_create_conversation(&self, a: &str, b: &str) -> Result<ConversationRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = get_or_create_conversation_tx(&tx, a, b)?;
            tx.commit()?;
            Ok(row)
        })
    }

    /// Fetch a conversation only if `user_id` is one of its participants.
    pub fn conversation_for_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_a, user_b, last_message_id, created_at, updated_at
                 FROM conversations
                 WHERE id = ?1 AND (user_a = ?2 OR user_b = ?2)",
            )?;
            stmt.query_row(rusqlite::params![conversation_id, user_id], conversation_from_row)
                .optional()
        })
    }

    /// All conversations containing `user_id`, most recently active first,
    /// with the other participant's display fields and the last message.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id,
                        CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END,
                        u.username, u.avatar_url,
                        c.updated_at,
                        m.id, m.conversation_id, m.sender_id, su.username, su.avatar_url,
                        m.text, m.seen, m.created_at
                 FROM conversations c
                 LEFT JOIN users u
                     ON u.id = CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END
                 LEFT JOIN messages m ON m.id = c.last_message_id
                 LEFT JOIN users su ON su.id = m.sender_id
                 WHERE c.user_a = ?1 OR c.user_b = ?1
                 ORDER BY c.updated_at DESC, c.id ASC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    let last_message_id: Option<String> = row.get(5)?;
                    let last_message = match last_message_id {
                        Some(mid) => Some(MessageRow {
                            id: mid,
                            conversation_id: row.get(6)?,
                            sender_id: row.get(7)?,
                            sender_username: row
                                .get::<_, Option<String>>(8)?
                                .unwrap_or_else(|| "unknown".to_string()),
                            sender_avatar_url: row.get(9)?,
                            text: row.get(10)?,
                            seen: row.get::<_, i64>(11)? != 0,
                            created_at: row.get(12)?,
                        }),
                        None => None,
                    };
                    Ok(ConversationSummaryRow {
                        id: row.get(0)?,
                        other_user_id: row.get(1)?,
                        other_username: row
                            .get::<_, Option<String>>(2)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        other_avatar_url: row.get(3)?,
                        last_message,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// The durable part of the send flow, in one transaction: resolve or
    /// create the conversation, append the message unseen, and move the
    /// conversation's last-message pointer. Returns the stored message with
    /// sender display fields joined.
    pub fn store_direct_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let conversation = get_or_create_conversation_tx(&tx, sender_id, receiver_id)?;
            let message_id = Uuid::new_v4().to_string();
            let now = now_ts();

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, text, seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![message_id, conversation.id, sender_id, text, now],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![message_id, now, conversation.id],
            )?;

            let row = query_message(&tx, &message_id)?
                .ok_or_else(|| anyhow!("Message {} vanished after insert", message_id))?;

            tx.commit()?;
            Ok(row)
        })
    }

    /// Messages of one conversation in chronological order, created_at
    /// ascending with message id as tiebreak. `limit`/`before` page from the
    /// newest end without changing the ordering of what is returned.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, u.avatar_url,
                        m.text, m.seen, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                   AND (?2 IS NULL OR m.created_at < ?2)
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?3",
            )?;

            // LIMIT -1 means unbounded in SQLite
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let mut rows = stmt
                .query_map(rusqlite::params![conversation_id, before, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.reverse();
            Ok(rows)
        })
    }

    /// Flip `seen` on every message in the conversation not sent by
    /// `user_id`. Idempotent; returns the number of rows flipped.
    pub fn mark_seen(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET seen = 1
                 WHERE conversation_id = ?1 AND sender_id <> ?2 AND seen = 0",
                rusqlite::params![conversation_id, user_id],
            )?;
            Ok(changed)
        })
    }

    /// Derived unread aggregate: unseen messages addressed to `user_id`
    /// across all their conversations. Computed from the messages table on
    /// every call — there is no counter to drift.
    pub fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM messages m
                 JOIN conversations c ON m.conversation_id = c.id
                 WHERE (c.user_a = ?1 OR c.user_b = ?1)
                   AND m.sender_id <> ?1
                   AND m.seen = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn get_or_create_conversation_tx(conn: &Connection, a: &str, b: &str) -> Result<ConversationRow> {
    let key = pair_key(a, b);
    let now = now_ts();
    let (first, second) = if a <= b { (a, b) } else { (b, a) };

    conn.execute(
        "INSERT INTO conversations (id, user_a, user_b, pair_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(pair_key) DO NOTHING",
        rusqlite::params![Uuid::new_v4().to_string(), first, second, key, now],
    )?;

    let mut stmt = conn.prepare(
        "SELECT id, user_a, user_b, last_message_id, created_at, updated_at
         FROM conversations WHERE pair_key = ?1",
    )?;
    stmt.query_row([&key], conversation_from_row)
        .optional()?
        .ok_or_else(|| anyhow!("Conversation for pair {} missing after insert", key))
}

fn query_message(conn: &Connection, message_id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.conversation_id, m.sender_id, u.username, u.avatar_url,
                m.text, m.seen, m.created_at
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         WHERE m.id = ?1",
    )?;
    stmt.query_row([message_id], message_from_row).optional()
}

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        sender_avatar_url: row.get(4)?,
        text: row.get(5)?,
        seen: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

fn conversation_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        last_message_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "11111111-1111-1111-1111-111111111111";
    const BOB: &str = "22222222-2222-2222-2222-222222222222";
    const CAROL: &str = "33333333-3333-3333-3333-333333333333";

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(ALICE, "alice", Some("https://cdn/alice.png")).unwrap();
        db.upsert_user(BOB, "bob", None).unwrap();
        db.upsert_user(CAROL, "carol", None).unwrap();
        db
    }

    #[test]
    fn get_or_create_is_order_independent() {
        let db = test_db();
        let c1 = db.get_or_create_conversation(ALICE, BOB).unwrap();
        let c2 = db.get_or_create_conversation(BOB, ALICE).unwrap();
        assert_eq!(c1.id, c2.id);

        // Still exactly one row
        let listed = db.list_conversations(ALICE).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn concurrent_get_or_create_converges_on_one_row() {
        use std::sync::Arc;

        let db = Arc::new(test_db());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let (a, b) = if i % 2 == 0 { (ALICE, BOB) } else { (BOB, ALICE) };
                    db.get_or_create_conversation(a, b).unwrap().id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(db.list_conversations(ALICE).unwrap().len(), 1);
    }

    #[test]
    fn first_send_creates_conversation_and_counts_unread() {
        let db = test_db();
        let msg = db.store_direct_message(ALICE, BOB, "hi").unwrap();
        assert!(!msg.seen);
        assert_eq!(msg.sender_username, "alice");

        let conv = db.get_or_create_conversation(BOB, ALICE).unwrap();
        assert_eq!(conv.id, msg.conversation_id);
        assert_eq!(conv.last_message_id.as_deref(), Some(msg.id.as_str()));

        assert_eq!(db.unread_count(BOB).unwrap(), 1);
        assert_eq!(db.unread_count(ALICE).unwrap(), 0);
    }

    #[test]
    fn send_then_list_observes_message() {
        let db = test_db();
        let msg = db.store_direct_message(ALICE, BOB, "hello bob").unwrap();
        let messages = db.list_messages(&msg.conversation_id, None, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello bob");
    }

    #[test]
    fn messages_are_chronological_with_id_tiebreak() {
        let db = test_db();
        let conv = db.get_or_create_conversation(ALICE, BOB).unwrap();

        // Two rows with identical timestamps must order by id ascending
        db.with_conn(|conn| {
            for id in ["aaa", "bbb"] {
                conn.execute(
                    "INSERT INTO messages (id, conversation_id, sender_id, text, seen, created_at)
                     VALUES (?1, ?2, ?3, 'tie', 0, '2024-01-01T00:00:00.000000Z')",
                    rusqlite::params![id, conv.id, ALICE],
                )?;
            }
            Ok(())
        })
        .unwrap();
        db.store_direct_message(ALICE, BOB, "later").unwrap();

        let messages = db.list_messages(&conv.id, None, None).unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids[0], "aaa");
        assert_eq!(ids[1], "bbb");
        assert_eq!(messages[2].text, "later");

        // Idempotent read: same order every time
        let again = db.list_messages(&conv.id, None, None).unwrap();
        assert!(messages.iter().zip(&again).all(|(a, b)| a.id == b.id));
    }

    #[test]
    fn pagination_preserves_ascending_order() {
        let db = test_db();
        for i in 0..5 {
            db.store_direct_message(ALICE, BOB, &format!("m{}", i)).unwrap();
        }
        let conv = db.get_or_create_conversation(ALICE, BOB).unwrap();

        let last_two = db.list_messages(&conv.id, Some(2), None).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].text, "m3");
        assert_eq!(last_two[1].text, "m4");

        let older = db
            .list_messages(&conv.id, Some(2), Some(&last_two[0].created_at))
            .unwrap();
        assert_eq!(older[0].text, "m1");
        assert_eq!(older[1].text, "m2");
    }

    #[test]
    fn mark_seen_is_idempotent() {
        let db = test_db();
        let msg = db.store_direct_message(ALICE, BOB, "one").unwrap();
        db.store_direct_message(ALICE, BOB, "two").unwrap();
        assert_eq!(db.unread_count(BOB).unwrap(), 2);

        assert_eq!(db.mark_seen(&msg.conversation_id, BOB).unwrap(), 2);
        assert_eq!(db.unread_count(BOB).unwrap(), 0);

        // Second call flips nothing and changes no state
        assert_eq!(db.mark_seen(&msg.conversation_id, BOB).unwrap(), 0);
        assert_eq!(db.unread_count(BOB).unwrap(), 0);

        let messages = db.list_messages(&msg.conversation_id, None, None).unwrap();
        assert!(messages.iter().all(|m| m.seen));
    }

    #[test]
    fn mark_seen_does_not_touch_own_messages() {
        let db = test_db();
        let msg = db.store_direct_message(ALICE, BOB, "from alice").unwrap();
        db.store_direct_message(BOB, ALICE, "from bob").unwrap();

        db.mark_seen(&msg.conversation_id, BOB).unwrap();

        // Bob's own message stays unseen for Alice
        assert_eq!(db.unread_count(ALICE).unwrap(), 1);
    }

    #[test]
    fn unread_returns_to_prior_value_after_mark_seen() {
        let db = test_db();
        db.store_direct_message(ALICE, BOB, "old").unwrap();
        let conv = db.get_or_create_conversation(ALICE, BOB).unwrap();
        db.mark_seen(&conv.id, BOB).unwrap();
        let before = db.unread_count(BOB).unwrap();

        db.store_direct_message(ALICE, BOB, "new").unwrap();
        assert_eq!(db.unread_count(BOB).unwrap(), before + 1);

        db.mark_seen(&conv.id, BOB).unwrap();
        assert_eq!(db.unread_count(BOB).unwrap(), before);
    }

    #[test]
    fn participant_check_rejects_outsiders() {
        let db = test_db();
        let msg = db.store_direct_message(ALICE, BOB, "private").unwrap();

        assert!(db
            .conversation_for_participant(&msg.conversation_id, CAROL)
            .unwrap()
            .is_none());
        assert!(db
            .conversation_for_participant(&msg.conversation_id, ALICE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn inbox_orders_by_recent_activity_and_joins_display_fields() {
        let db = test_db();
        db.store_direct_message(ALICE, BOB, "to bob").unwrap();
        db.store_direct_message(ALICE, CAROL, "to carol").unwrap();

        let inbox = db.list_conversations(ALICE).unwrap();
        assert_eq!(inbox.len(), 2);
        // Carol's conversation was touched last
        assert_eq!(inbox[0].other_username, "carol");
        assert_eq!(inbox[1].other_username, "bob");
        assert_eq!(inbox[1].last_message.as_ref().unwrap().text, "to bob");

        // Fresh activity reorders
        db.store_direct_message(BOB, ALICE, "reply").unwrap();
        let inbox = db.list_conversations(ALICE).unwrap();
        assert_eq!(inbox[0].other_username, "bob");
        assert_eq!(inbox[0].last_message.as_ref().unwrap().text, "reply");
    }
}
