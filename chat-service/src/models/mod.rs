//! Domain models for the chat service.

mod message;
mod session;

pub use message::{fingerprint, Message, Role};
pub use session::{Session, SessionSummary};
