//! membership-daemon library: runs agents over WebSockets.
//!
//! A thin layer over membership-core: the network inbox, outgoing links,
//! and the control thread behind [`Node`]. Exposed as a library so
//! integration tests and embedding applications can start nodes directly.

pub mod connection;
pub mod driver;
pub mod node;
pub mod outgoing;
pub mod server;

pub use node::Node;
pub use outgoing::{ReconnectConfig, WsLink, WsTransport};
pub use server::Inbox;
