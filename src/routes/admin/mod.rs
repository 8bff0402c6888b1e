mod handler;

pub use handler::reconcile;
