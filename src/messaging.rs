//! Chat transport: the collaborator trait and the Discord adapter.

pub mod discord;
pub mod traits;

pub use discord::{DiscordTransport, Handler, RelayState};
pub use traits::{Transport, TransportDyn};
