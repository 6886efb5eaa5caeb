//! Authentication for staff endpoints

pub mod middleware;

pub use middleware::{require_staff, AuthError, STAFF_ID_HEADER};
