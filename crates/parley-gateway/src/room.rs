use uuid::Uuid;

/// Resolve the broadcast room for a "conversation id or peer" address.
///
/// Precedence rule: an explicit conversation id always wins. Without one,
/// the room is the two user ids sorted lexicographically ascending and
/// joined with '_', so both ends compute the same room regardless of
/// argument order.
pub fn derive_room_id(chat_id: Option<&str>, me: Uuid, other: Uuid) -> String {
    if let Some(id) = chat_id {
        return id.to_string();
    }
    let (a, b) = (me.to_string(), other.to_string());
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}
