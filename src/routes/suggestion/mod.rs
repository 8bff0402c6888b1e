mod handler;
mod model;

pub use handler::get_suggestions;
pub use model::{MAX_SUGGESTIONS, Suggestion, suggest_events, suggestions_for};
