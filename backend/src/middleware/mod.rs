//! Request extractors

pub mod auth;

pub use auth::{CurrentUser, USER_ID_HEADER};
