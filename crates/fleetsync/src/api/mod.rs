//! API route handlers

pub mod error;
pub mod sync;
pub mod system;
pub mod tunnel;
