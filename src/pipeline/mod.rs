// Ingestion pipeline: stream message -> report -> reporting API.
//
// The driver demultiplexes the stream and hands posts to the dispatcher,
// which runs extraction, the avatar fetch, report building and delivery in
// one independent task per post.

pub mod dispatch;
pub mod driver;
pub mod extract;
pub mod image;
pub mod report;
pub mod sink;
