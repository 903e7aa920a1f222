// Twitter filter stream - message model, framing, signing, and sources.
//
// Everything the relay knows about the upstream provider lives here. The
// pipeline only sees `StreamSource`, `Subscription` and `StreamMessage`.

pub mod framing;
pub mod models;
pub mod oauth;
pub mod replay;
pub mod source;
