mod handler;
mod model;

pub use handler::{get_profile, update_profile};
pub use model::UpdateProfileRequest;
