use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named collections the persistence adapter knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Profile,
    Room,
    Message,
    Group,
    GroupMessage,
    SupportMessage,
    LoginEvent,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Profile,
        Collection::Room,
        Collection::Message,
        Collection::Group,
        Collection::GroupMessage,
        Collection::SupportMessage,
        Collection::LoginEvent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Profile => "Profile",
            Collection::Room => "Room",
            Collection::Message => "Message",
            Collection::Group => "Group",
            Collection::GroupMessage => "GroupMessage",
            Collection::SupportMessage => "SupportMessage",
            Collection::LoginEvent => "LoginEvent",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Collection::Profile => "profiles",
            Collection::Room => "rooms",
            Collection::Message => "messages",
            Collection::Group => "chat_groups",
            Collection::GroupMessage => "group_messages",
            Collection::SupportMessage => "support_messages",
            Collection::LoginEvent => "login_events",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub birth_year: Option<i64>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_color: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub gallery_images: Vec<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub logout_block_until: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Room {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub participant_names: Vec<String>,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub last_message: Option<String>,
}

impl Room {
    /// The other participant, from my point of view. `None` when the room
    /// does not contain exactly two participants including me.
    pub fn partner_of(&self, me: &str) -> Option<&str> {
        if self.participant_ids.len() != 2 {
            return None;
        }
        if !self.participant_ids.iter().any(|p| p == me) {
            return None;
        }
        self.participant_ids
            .iter()
            .find(|p| p.as_str() != me)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub read_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub member_count: i64,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub status: GroupStatus,
    #[serde(default)]
    pub inactive_since: Option<String>,
}

impl Default for Group {
    fn default() -> Self {
        Group {
            id: String::new(),
            created_date: None,
            updated_date: None,
            name: String::new(),
            description: None,
            creator_id: String::new(),
            creator_name: None,
            member_ids: Vec::new(),
            member_count: 0,
            is_public: true,
            status: GroupStatus::Active,
            inactive_since: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub updated_date: Option<String>,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub read_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SupportMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Common view over direct and group messages, used by unread accounting.
pub trait Readable {
    fn id(&self) -> &str;
    fn sender_id(&self) -> &str;
    fn read_by(&self) -> &[String];
}

impl Readable for Message {
    fn id(&self) -> &str {
        &self.id
    }
    fn sender_id(&self) -> &str {
        &self.sender_id
    }
    fn read_by(&self) -> &[String] {
        &self.read_by
    }
}

impl Readable for GroupMessage {
    fn id(&self) -> &str {
        &self.id
    }
    fn sender_id(&self) -> &str {
        &self.sender_id
    }
    fn read_by(&self) -> &[String] {
        &self.read_by
    }
}

/// Decode a raw store record into a typed model. Unknown fields are ignored
/// and missing ones fall back to defaults, so records written by newer or
/// older clients still decode.
pub fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}

pub fn decode_all<T: serde::de::DeserializeOwned>(values: &[Value]) -> Vec<T> {
    values.iter().filter_map(decode).collect()
}
