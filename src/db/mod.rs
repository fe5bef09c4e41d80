//! Database module for pingtrail.
//!
//! SQLite storage for sample series, reports and the job manifest, with
//! embedded migrations and spreadsheet export.

mod export;
mod models;
mod store;

pub use models::*;
pub use store::*;
