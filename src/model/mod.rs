//! Data models shared by the relay, the client and the session controller.
//!
//! Wire shapes live in `descriptor`, `payload` and `wire`; `registry` is the
//! relay's membership table and `link` wraps the str0m peer connection.

pub mod descriptor;
pub mod link;
pub mod payload;
pub mod registry;
pub mod session;
pub mod wire;
