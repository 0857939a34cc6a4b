//! Domain-suffix and subnet classification index.

mod config;
mod list;

pub use config::{AccessListConfig, AccessListError};
pub use list::AccessList;
