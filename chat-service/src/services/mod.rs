pub mod backends;
pub mod database;
pub mod dedup;
pub mod history;
pub mod metrics;
pub mod model_manager;
pub mod pipeline;
pub mod store;
pub mod uploads;

pub use backends::BackendRegistry;
pub use database::PgChatStore;
pub use dedup::{AssistantReply, DedupGuard, DuplicateReason, LogOutcome};
pub use model_manager::{LoadOutcome, ManagerError, ModelManager};
pub use pipeline::{GenerateResponse, GenerationPipeline, StreamEvent, TurnRequest};
pub use store::{AppendOutcome, ChatStore, InMemoryChatStore};
pub use uploads::UploadStore;

/// First 64 characters of `text`, for log fields.
pub(crate) fn preview(text: &str) -> String {
    const LIMIT: usize = 64;
    match text.char_indices().nth(LIMIT) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
