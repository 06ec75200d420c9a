//! Request handlers.

pub mod chat;
pub mod misc;
pub mod sessions;
