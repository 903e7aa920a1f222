// Field extraction - pure functions over an inbound post.
//
// Posts arrive in several shapes: plain, truncated with an extended body,
// retweets wrapping another post (which may itself be extended), with or
// without entity lists. None of these functions fail; missing pieces come
// back as "" or an empty list.

use chrono::{DateTime, FixedOffset};

use crate::twitter::models::InboundPost;

/// Timestamp format used by the stream, e.g. "Wed Oct 10 20:19:24 +0000 2018".
pub const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// The text a reader would see for this post.
///
/// Retweets are unwrapped first, since the retweet's own `text` is a
/// truncated "RT @user: ..." copy; then the extended body wins over the
/// primary text when present.
pub fn resolve_display_text(post: &InboundPost) -> String {
    let source = post.retweeted_status.as_deref().unwrap_or(post);

    source
        .extended_tweet
        .as_ref()
        .and_then(|ext| ext.full_text.clone())
        .unwrap_or_else(|| source.text.clone())
}

/// URLs embedded in the post, in source order. Never `None`: the report
/// must carry `"urls": []` rather than omit the field.
pub fn extract_urls(post: &InboundPost) -> Vec<String> {
    post.entities
        .as_ref()
        .and_then(|entities| entities.urls.as_ref())
        .map(|urls| urls.iter().map(|entity| entity.url.clone()).collect())
        .unwrap_or_default()
}

/// Full-resolution avatar URL: the thumbnail URL with its "_normal" size
/// suffix removed.
pub fn resolve_avatar_url(thumbnail_url: &str) -> String {
    thumbnail_url.replace("_normal", "")
}

/// Parse the provider timestamp. Only used for lag logging; reports keep
/// the verbatim string.
pub fn parse_created_at(post: &InboundPost) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(&post.created_at, CREATED_AT_FORMAT).ok()
}
