pub mod dispatcher;
pub mod jobs;
pub mod registry;

/// Identifier the server assigns to each accepted connection.
pub type ConnectionId = u64;
