//! Staged editing of the book listing filters and their URL projection.

mod staging;
mod state;
pub mod url;

pub use staging::FilterStaging;
pub use state::{FilterPatch, FilterState};
