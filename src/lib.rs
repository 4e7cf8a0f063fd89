//! Client-side data synchronization for the Libris digital library.
//!
//! Views read through [`application::queries::LibraryQueries`], write through
//! [`application::mutations::MutationCoordinator`], and never touch the
//! [`cache::QueryCache`] directly.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;

pub use application::context::LibraryContext;
pub use application::error::AppError;
