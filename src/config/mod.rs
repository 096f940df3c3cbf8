//! Configuration schema and live store

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
