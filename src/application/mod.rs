//! Application layer: the services views call, wired through [`context::LibraryContext`].

pub mod context;
pub mod error;
pub mod filters;
pub mod mutations;
pub mod preferences;
pub mod queries;
pub mod recommendations;
pub mod session;
