// Tweet Relay: forwards a filtered Twitter stream to a reporting API.
//
// This is the library root. Each module corresponds to a major subsystem
// of the relay.

pub mod config;
pub mod liveness;
pub mod pipeline;
pub mod twitter;
