mod handler;
mod model;

pub use handler::{
    delete_message, list_messages, moderate_message, post_message, report_message,
    stream_messages,
};
pub use model::{ModerateRequest, PostMessageRequest, ReportMessageRequest, visible_to};
