/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct ConversationRow {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub last_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A message row with sender display fields joined in. The join is a
/// read-side step — the messages table itself stores only the sender id.
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub sender_avatar_url: Option<String>,
    pub text: String,
    pub seen: bool,
    pub created_at: String,
}

pub struct ConversationSummaryRow {
    pub id: String,
    pub other_user_id: String,
    pub other_username: String,
    pub other_avatar_url: Option<String>,
    pub last_message: Option<MessageRow>,
    pub updated_at: String,
}
