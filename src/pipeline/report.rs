// Report construction - one normalized record per inbound post.
//
// The reporting API expects a fixed schema. Most fields are constants: posts
// from the stream are anonymous, unmoderated-but-approved, have no location
// and no engagement yet.

use serde::{Deserialize, Serialize};

use super::extract::{extract_urls, resolve_avatar_url, resolve_display_text};
use super::image::AvatarFetcher;
use crate::twitter::models::InboundPost;

/// The record POSTed to the reporting API. Built once, serialized, dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReport {
    pub title: String,
    pub from_source: bool,
    pub urls: Vec<String>,
    /// Unpadded base64 avatar, or "" when the fetch failed.
    pub image: String,
    pub anonymous: bool,
    pub long: f64,
    pub lat: f64,
    pub loc: String,
    pub body: String,
    pub featured: bool,
    pub author: String,
    /// Provider timestamp, verbatim.
    pub time: String,
    pub approved: bool,
    pub upvotes: i64,
    pub downvotes: i64,
    pub has_video: bool,
}

impl NormalizedReport {
    /// Assemble a report from a post and an already-fetched avatar payload.
    pub fn from_post(post: &InboundPost, image: String) -> Self {
        Self {
            title: post.text.clone(),
            from_source: true,
            urls: extract_urls(post),
            image,
            anonymous: true,
            long: 0.0,
            lat: 0.0,
            loc: String::new(),
            body: resolve_display_text(post),
            featured: false,
            author: post.author_handle().to_string(),
            time: post.created_at.clone(),
            approved: true,
            upvotes: 0,
            downvotes: 0,
            has_video: false,
        }
    }
}

/// Fetch the author's full-size avatar and build the report. Cannot fail:
/// a failed fetch just leaves `image` empty.
pub async fn build_report(post: &InboundPost, fetcher: &dyn AvatarFetcher) -> NormalizedReport {
    let avatar_url = resolve_avatar_url(post.avatar_thumbnail_url());
    let image = fetcher.fetch_base64(&avatar_url).await;
    NormalizedReport::from_post(post, image)
}
