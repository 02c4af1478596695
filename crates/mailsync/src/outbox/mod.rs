//! Offline outbox
//!
//! Durable FIFO of messages waiting to be sent, with their attachment files
//! kept on disk next to the database.

mod attachments;
mod compose;
mod queue;

pub use attachments::AttachmentStore;
pub use compose::compose_message;
pub use queue::{DrainReport, OutboxQueue};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox item {0} not found")]
    NotFound(Uuid),

    #[error("outbox item {0} is being sent")]
    InFlight(Uuid),

    #[error("message has no recipients")]
    NoRecipients,
}
