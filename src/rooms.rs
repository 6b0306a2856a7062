//! Room and group messaging operations. Sends are gated locally by the quota
//! governor before any write happens.

use serde_json::json;

use crate::error::StoreError;
use crate::models::{decode, decode_all, Collection, Group, Message, Profile, Room};
use crate::quota;
use crate::store::{fields, JsonMap, Store};

/// Optional payload attached to a direct message.
#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub image_url: Option<String>,
}

impl Attachment {
    fn is_empty(&self) -> bool {
        self.file_url.is_none() && self.file_name.is_none() && self.image_url.is_none()
    }
}

/// Finds the room for an unordered participant pair, creating it on first
/// contact. At most one room exists per pair.
pub async fn open_room(store: &Store, me: &Profile, partner: &Profile) -> Result<Room, StoreError> {
    let existing = store.list(Collection::Room, "-updated_date", 100).await?;
    for raw in &existing {
        if let Some(room) = decode::<Room>(raw) {
            if room.participant_ids.len() == 2
                && room.participant_ids.iter().any(|p| p == &me.id)
                && room.participant_ids.iter().any(|p| p == &partner.id)
            {
                return Ok(room);
            }
        }
    }

    let created = store
        .create(
            Collection::Room,
            fields(&[
                ("participant_ids", json!([me.id, partner.id])),
                (
                    "participant_names",
                    json!([me.display_name, partner.display_name]),
                ),
                ("status", json!("active")),
            ]),
        )
        .await?;
    decode(&created).ok_or_else(|| StoreError::Persistence("created room did not decode".into()))
}

/// The room's full message log in creation order.
pub async fn room_messages(store: &Store, room_id: &str) -> Result<Vec<Message>, StoreError> {
    let raw = store
        .filter(
            Collection::Message,
            fields(&[("room_id", json!(room_id))]),
            "created_date",
            200,
        )
        .await?;
    Ok(decode_all(&raw))
}

/// Sends a direct message. Fails with `QuotaExceeded` before anything is
/// written when the allowance is used up; on success the room's
/// `last_message` preview is refreshed.
pub async fn send_message(
    store: &Store,
    room: &Room,
    me: &Profile,
    content: Option<&str>,
    attachment: Attachment,
) -> Result<Message, StoreError> {
    let content = content.map(str::trim).filter(|c| !c.is_empty());
    if content.is_none() && attachment.is_empty() {
        return Err(StoreError::Validation("message has no content".into()));
    }

    let partner = room.partner_of(&me.id);
    let log = room_messages(store, &room.id).await?;
    quota::check_send(&log, &me.id, partner)?;

    let mut data: JsonMap = fields(&[
        ("room_id", json!(room.id)),
        ("sender_id", json!(me.id)),
        ("sender_name", json!(me.display_name)),
        ("read_by", json!([me.id])),
    ]);
    if let Some(content) = content {
        data.insert("content".into(), json!(content));
    }
    if let Some(url) = &attachment.file_url {
        data.insert("file_url".into(), json!(url));
    }
    if let Some(name) = &attachment.file_name {
        data.insert("file_name".into(), json!(name));
    }
    if let Some(url) = &attachment.image_url {
        data.insert("image_url".into(), json!(url));
    }

    let created = store.create(Collection::Message, data).await?;

    let preview = content
        .map(str::to_string)
        .or_else(|| attachment.file_name.clone())
        .unwrap_or_else(|| "[attachment]".to_string());
    store
        .update(
            Collection::Room,
            &room.id,
            fields(&[("last_message", json!(preview))]),
        )
        .await?;

    decode(&created).ok_or_else(|| StoreError::Persistence("created message did not decode".into()))
}

pub async fn create_group(
    store: &Store,
    me: &Profile,
    name: &str,
    description: Option<&str>,
) -> Result<Group, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Validation("group name is required".into()));
    }
    let created = store
        .create(
            Collection::Group,
            fields(&[
                ("name", json!(name)),
                ("description", json!(description)),
                ("creator_id", json!(me.id)),
                ("creator_name", json!(me.display_name)),
                ("member_ids", json!([me.id])),
                ("member_count", json!(1)),
                ("is_public", json!(true)),
                ("status", json!("active")),
            ]),
        )
        .await?;
    decode(&created).ok_or_else(|| StoreError::Persistence("created group did not decode".into()))
}

pub async fn join_group(store: &Store, group: &Group, me: &str) -> Result<Group, StoreError> {
    let mut members = group.member_ids.clone();
    if !members.iter().any(|m| m == me) {
        members.push(me.to_string());
    }
    update_membership(store, &group.id, members).await
}

pub async fn leave_group(store: &Store, group: &Group, me: &str) -> Result<Group, StoreError> {
    let members: Vec<String> = group
        .member_ids
        .iter()
        .filter(|m| m.as_str() != me)
        .cloned()
        .collect();
    update_membership(store, &group.id, members).await
}

async fn update_membership(
    store: &Store,
    group_id: &str,
    members: Vec<String>,
) -> Result<Group, StoreError> {
    // member_count is denormalized; keep it in lockstep with the set.
    let updated = store
        .update(
            Collection::Group,
            group_id,
            fields(&[
                ("member_ids", json!(members)),
                ("member_count", json!(members.len())),
            ]),
        )
        .await?;
    decode(&updated).ok_or_else(|| StoreError::Persistence("updated group did not decode".into()))
}

pub async fn group_messages(
    store: &Store,
    group_id: &str,
) -> Result<Vec<crate::models::GroupMessage>, StoreError> {
    let raw = store
        .filter(
            Collection::GroupMessage,
            fields(&[("group_id", json!(group_id))]),
            "created_date",
            200,
        )
        .await?;
    Ok(decode_all(&raw))
}

pub async fn send_group_message(
    store: &Store,
    group: &Group,
    me: &Profile,
    content: &str,
) -> Result<crate::models::GroupMessage, StoreError> {
    if !group.member_ids.iter().any(|m| m == &me.id) {
        return Err(StoreError::Validation(format!(
            "{} is not a member of group {}",
            me.id, group.id
        )));
    }
    let content = content.trim();
    if content.is_empty() {
        return Err(StoreError::Validation("message has no content".into()));
    }
    let created = store
        .create(
            Collection::GroupMessage,
            fields(&[
                ("group_id", json!(group.id)),
                ("sender_id", json!(me.id)),
                ("sender_name", json!(me.display_name)),
                ("content", json!(content)),
                ("read_by", json!([me.id])),
            ]),
        )
        .await?;
    decode(&created)
        .ok_or_else(|| StoreError::Persistence("created group message did not decode".into()))
}

pub async fn send_support_message(
    store: &Store,
    me: &Profile,
    subject: &str,
    body: &str,
    kind: Option<&str>,
) -> Result<(), StoreError> {
    store
        .create(
            Collection::SupportMessage,
            fields(&[
                ("sender_id", json!(me.id)),
                ("sender_name", json!(me.display_name)),
                ("subject", json!(subject)),
                ("body", json!(body)),
                ("kind", json!(kind)),
            ]),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaReason;
    use crate::store::sqlite::SqliteBackend;

    fn profile(id: &str, name: &str) -> Profile {
        Profile {
            id: id.to_string(),
            display_name: name.to_string(),
            ..Profile::default()
        }
    }

    fn store() -> Store {
        Store::open(SqliteBackend::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_open_room_is_idempotent_per_pair() {
        let store = store();
        let alice = profile("a", "alice");
        let bob = profile("b", "bob");

        let first = open_room(&store, &alice, &bob).await.unwrap();
        // Opening from the other side finds the same room.
        let second = open_room(&store, &bob, &alice).await.unwrap();
        assert_eq!(first.id, second.id);

        let rooms = store.list(Collection::Room, "-created_date", 10).await.unwrap();
        assert_eq!(rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_send_creates_message_read_by_sender() {
        let store = store();
        let alice = profile("a", "alice");
        let bob = profile("b", "bob");
        let room = open_room(&store, &alice, &bob).await.unwrap();

        let message = send_message(&store, &room, &alice, Some("hi bob"), Attachment::default())
            .await
            .unwrap();
        assert_eq!(message.read_by, vec!["a".to_string()]);
        assert_eq!(message.sender_id, "a");

        let rooms = store.list(Collection::Room, "-created_date", 10).await.unwrap();
        assert_eq!(rooms[0]["last_message"], "hi bob");
    }

    #[tokio::test]
    async fn test_fourth_unanswered_send_is_rejected_before_writing() {
        let store = store();
        let alice = profile("a", "alice");
        let bob = profile("b", "bob");
        let room = open_room(&store, &alice, &bob).await.unwrap();

        for i in 0..3 {
            let text = format!("msg {i}");
            send_message(&store, &room, &alice, Some(text.as_str()), Attachment::default())
                .await
                .unwrap();
        }
        let err = send_message(&store, &room, &alice, Some("one too many"), Attachment::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::QuotaExceeded(QuotaReason::BeforeReply)
        ));

        // Nothing was written for the rejected attempt.
        let log = room_messages(&store, &room.id).await.unwrap();
        assert_eq!(log.len(), 3);

        // A reply reopens the window.
        send_message(&store, &room, &bob, Some("hi alice"), Attachment::default())
            .await
            .unwrap();
        send_message(&store, &room, &alice, Some("welcome back"), Attachment::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let store = store();
        let alice = profile("a", "alice");
        let bob = profile("b", "bob");
        let room = open_room(&store, &alice, &bob).await.unwrap();
        let err = send_message(&store, &room, &alice, Some("   "), Attachment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_attachment_only_message_is_allowed() {
        let store = store();
        let alice = profile("a", "alice");
        let bob = profile("b", "bob");
        let room = open_room(&store, &alice, &bob).await.unwrap();
        let attachment = Attachment {
            file_url: Some("data:application/pdf;base64,AAAA".into()),
            file_name: Some("notes.pdf".into()),
            image_url: None,
        };
        let message = send_message(&store, &room, &alice, None, attachment).await.unwrap();
        assert_eq!(message.file_name.as_deref(), Some("notes.pdf"));

        let rooms = store.list(Collection::Room, "-created_date", 10).await.unwrap();
        assert_eq!(rooms[0]["last_message"], "notes.pdf");
    }

    #[tokio::test]
    async fn test_group_membership_keeps_count_in_sync() {
        let store = store();
        let alice = profile("a", "alice");
        let group = create_group(&store, &alice, "owls", None).await.unwrap();
        assert_eq!(group.member_count, 1);

        let group = join_group(&store, &group, "b").await.unwrap();
        assert_eq!(group.member_ids.len(), 2);
        assert_eq!(group.member_count, 2);

        // Joining twice changes nothing.
        let group = join_group(&store, &group, "b").await.unwrap();
        assert_eq!(group.member_count, 2);

        let group = leave_group(&store, &group, "a").await.unwrap();
        assert_eq!(group.member_ids, vec!["b".to_string()]);
        assert_eq!(group.member_count, 1);
    }

    #[tokio::test]
    async fn test_group_send_requires_membership() {
        let store = store();
        let alice = profile("a", "alice");
        let mallory = profile("m", "mallory");
        let group = create_group(&store, &alice, "owls", None).await.unwrap();

        let err = send_group_message(&store, &group, &mallory, "let me in")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let message = send_group_message(&store, &group, &alice, "hello owls")
            .await
            .unwrap();
        assert_eq!(message.read_by, vec!["a".to_string()]);
    }
}
