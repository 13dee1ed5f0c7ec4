//! Session state machine, engine and UI binding
//!
//! [`machine::step`] holds the transition rules. [`SessionManager`] runs them
//! against the real world: it owns the connection, relays envelopes, decodes
//! data channel frames into the [`MessageHistory`] and publishes
//! [`SessionEvent`]s. UI code talks to it through [`SecureDropHandle`].

pub mod events;
pub mod history;
pub mod machine;
pub mod manager;
pub mod state;

pub use events::{DisconnectReason, SessionEvent};
pub use history::{ChatMessage, Direction, MessageHistory, MessagePayload, MessageStatus};
pub use manager::{SecureDropHandle, SessionManager};
pub use state::SessionState;
