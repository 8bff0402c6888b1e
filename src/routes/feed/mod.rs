mod handler;
mod model;

pub use handler::{
    add_comment, create_post, delete_comment, delete_post, get_feed, list_comments, pin_post,
    react, stream_feed, unpin_post,
};
pub use model::{CreateCommentRequest, CreatePostRequest, ReactRequest, sort_feed};
