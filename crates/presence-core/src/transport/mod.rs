//! Addressed, multi-part messaging over TCP.
//!
//! Two socket roles, shaped after a ROUTER/DEALER pair:
//!
//! - **Router**: binds, accepts many peers, prefixes every inbound message with
//!   the sender's identity and routes outbound messages by that identity
//! - **Dealer**: connects to one router and exchanges messages with it
//!
//! There is no request/reply correlation at this layer; that is the job of the
//! broker protocol built on top.

mod dealer;
pub mod frame;
mod router;

use bytes::Bytes;

pub use dealer::DealerSocket;
pub use router::{RouterEvent, RouterSocket};

/// One message: an ordered list of opaque parts.
pub type Multipart = Vec<Bytes>;

/// Render a peer identity token for logs and registries.
pub fn display_identity(identity: &[u8]) -> String {
    hex::encode(identity)
}
