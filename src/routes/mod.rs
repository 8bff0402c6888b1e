pub mod admin;
pub mod chat;
pub mod feed;
pub mod group;
pub mod profile;
pub mod subscription;
pub mod suggestion;
