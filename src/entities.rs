use serde::{Deserialize, Serialize};

pub const HUMANS_TABLE: &str = "humans";
pub const ORGANIZATIONS_TABLE: &str = "organizations";
pub const CHAT_SHORTCUTS_TABLE: &str = "chat_shortcuts";
pub const CALENDARS_TABLE: &str = "calendars";
pub const CALENDARS_FILE: &str = "calendars.json";

/// Field stored as the Markdown body of a human document.
pub const HUMAN_BODY_FIELD: &str = "memo";
pub const CHAT_SHORTCUT_BODY_FIELD: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Human {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin_username: Option<String>,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatShortcut {
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub user_id: String,
    pub tracking_id_calendar: String,
    pub name: String,
    pub created_at: String,
    #[serde(default)]
    pub enabled: bool,
    pub provider: String,
}
