// Stream message model - serde types for the v1.1 filter stream payloads.
//
// The filter stream interleaves tweets with protocol notices (stall warnings,
// limit notices, deletions, disconnects). `StreamMessage::parse` classifies
// one line of the stream into a tagged variant so the driver can pattern-match
// instead of probing JSON keys itself.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A post as delivered by the stream. Only the fields the relay reads.
///
/// Every field falls back to its default, so a partial payload still
/// deserializes into a post with empty fields instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InboundPost {
    #[serde(deserialize_with = "null_as_default")]
    pub id_str: String,
    /// Provider timestamp, e.g. "Wed Oct 10 20:19:24 +0000 2018". Kept verbatim.
    #[serde(deserialize_with = "null_as_default")]
    pub created_at: String,
    /// Primary text, truncated to 140 characters for long posts.
    #[serde(deserialize_with = "null_as_default")]
    pub text: String,
    pub extended_tweet: Option<ExtendedTweet>,
    /// The original post when this one is a retweet.
    pub retweeted_status: Option<Box<InboundPost>>,
    pub entities: Option<Entities>,
    pub user: Option<Author>,
}

/// Full text of a post whose primary `text` was truncated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtendedTweet {
    pub full_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Entities {
    pub urls: Option<Vec<UrlEntity>>,
}

/// A link embedded in the post text. `url` is the shortened t.co form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UrlEntity {
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    pub expanded_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Author {
    #[serde(deserialize_with = "null_as_default")]
    pub screen_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub profile_image_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub profile_image_url_https: String,
}

impl InboundPost {
    /// The author's handle, or "" when the payload carries no user.
    pub fn author_handle(&self) -> &str {
        self.user
            .as_ref()
            .map(|u| u.screen_name.as_str())
            .unwrap_or_default()
    }

    /// The raw (thumbnail-sized) avatar URL. Prefers the https variant.
    pub fn avatar_thumbnail_url(&self) -> &str {
        match &self.user {
            Some(user) if !user.profile_image_url_https.is_empty() => {
                &user.profile_image_url_https
            }
            Some(user) => &user.profile_image_url,
            None => "",
        }
    }

    pub fn is_retweet(&self) -> bool {
        self.retweeted_status.is_some()
    }
}

/// One message from the stream, classified by kind.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Post(Box<InboundPost>),
    Status(StatusNotice),
    /// Anything else: unknown message kinds, or lines that are not JSON
    /// (carried as a JSON string holding the raw line).
    Other(Value),
}

/// Protocol and status messages that accompany the posts.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusNotice {
    StallWarning {
        code: String,
        message: String,
        percent_full: Option<u64>,
    },
    /// Number of matching posts withheld because the stream hit its rate cap.
    Limit { track: u64 },
    Deletion { id: String, user_id: String },
    LocationScrub { user_id: String, up_to_status_id: String },
    StatusWithheld { id: String, countries: Vec<String> },
    UserWithheld { id: String, countries: Vec<String> },
    Disconnect {
        code: u64,
        stream_name: String,
        reason: String,
    },
    Event { event: String, created_at: String },
}

impl StatusNotice {
    /// Short label used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusNotice::StallWarning { .. } => "stall_warning",
            StatusNotice::Limit { .. } => "limit",
            StatusNotice::Deletion { .. } => "delete",
            StatusNotice::LocationScrub { .. } => "scrub_geo",
            StatusNotice::StatusWithheld { .. } => "status_withheld",
            StatusNotice::UserWithheld { .. } => "user_withheld",
            StatusNotice::Disconnect { .. } => "disconnect",
            StatusNotice::Event { .. } => "event",
        }
    }
}

impl StreamMessage {
    /// Classify one line of the stream. Never fails: a line that is not
    /// valid JSON comes back as `Other` carrying the raw text.
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Self::from_value(value),
            Err(_) => StreamMessage::Other(Value::String(line.to_string())),
        }
    }

    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return StreamMessage::Other(value);
        };

        if obj.contains_key("text") && (obj.contains_key("id_str") || obj.contains_key("id")) {
            return match InboundPost::deserialize(&value) {
                Ok(post) => StreamMessage::Post(Box::new(post)),
                Err(_) => StreamMessage::Other(value),
            };
        }

        if let Some(body) = obj.get("delete") {
            let status = body.get("status").unwrap_or(&Value::Null);
            return StreamMessage::Status(StatusNotice::Deletion {
                id: string_at(status, &["id_str", "id"]),
                user_id: string_at(status, &["user_id_str", "user_id"]),
            });
        }
        if let Some(body) = obj.get("scrub_geo") {
            return StreamMessage::Status(StatusNotice::LocationScrub {
                user_id: string_at(body, &["user_id_str", "user_id"]),
                up_to_status_id: string_at(body, &["up_to_status_id_str", "up_to_status_id"]),
            });
        }
        if let Some(body) = obj.get("limit") {
            return StreamMessage::Status(StatusNotice::Limit {
                track: body.get("track").and_then(Value::as_u64).unwrap_or(0),
            });
        }
        if let Some(body) = obj.get("status_withheld") {
            return StreamMessage::Status(StatusNotice::StatusWithheld {
                id: string_at(body, &["id_str", "id"]),
                countries: countries(body),
            });
        }
        if let Some(body) = obj.get("user_withheld") {
            return StreamMessage::Status(StatusNotice::UserWithheld {
                id: string_at(body, &["id_str", "id"]),
                countries: countries(body),
            });
        }
        if let Some(body) = obj.get("disconnect") {
            return StreamMessage::Status(StatusNotice::Disconnect {
                code: body.get("code").and_then(Value::as_u64).unwrap_or(0),
                stream_name: string_at(body, &["stream_name"]),
                reason: string_at(body, &["reason"]),
            });
        }
        if let Some(body) = obj.get("warning") {
            return StreamMessage::Status(StatusNotice::StallWarning {
                code: string_at(body, &["code"]),
                message: string_at(body, &["message"]),
                percent_full: body.get("percent_full").and_then(Value::as_u64),
            });
        }
        if let Some(Value::String(event)) = obj.get("event") {
            return StreamMessage::Status(StatusNotice::Event {
                event: event.clone(),
                created_at: string_at(&value, &["created_at"]),
            });
        }

        StreamMessage::Other(value)
    }
}

/// First of `keys` present on `value`, rendered as a string. Numeric ids are
/// formatted; anything else (or nothing) yields "".
fn string_at(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match value.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

fn countries(value: &Value) -> Vec<String> {
    value
        .get("withheld_in_countries")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
