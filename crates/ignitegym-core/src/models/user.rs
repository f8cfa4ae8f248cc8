use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend user identifier. Older API builds emit numbers, newer ones strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(untagged)]
pub enum UserId {
    Number(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Number(n) => write!(f, "{}", n),
            UserId::Text(s) => f.write_str(s),
        }
    }
}

/// The signed-in user's profile.
///
/// Only `id` matters to the session layer. Fields the backend adds later are
/// kept in `extra` so they survive a load/save cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn new(id: UserId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            avatar: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Name to show in headers, falling back to the e-mail when unset.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// Body for `PUT /users`.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ProfileUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_password: Option<String>,
}

impl ProfileUpdate {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            old_password: None,
        }
    }
}

/// Body for `POST /users`.
#[derive(Debug, Clone, Serialize)]
pub struct SignUp {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Avatar image for `PATCH /users/avatar`.
///
/// Holds the raw bytes rather than a built multipart form so the request can
/// be sent again verbatim after a token refresh.
#[derive(Clone)]
pub struct AvatarUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AvatarUpload {
    /// Build an upload from a file name, guessing the MIME type from the extension.
    pub fn from_file_name(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let mime_type = match extension.as_str() {
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "heic" => "image/heic",
            _ => "image/jpeg",
        };
        Self {
            file_name,
            mime_type: mime_type.to_string(),
            bytes,
        }
    }
}

impl fmt::Debug for AvatarUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvatarUpload")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}
