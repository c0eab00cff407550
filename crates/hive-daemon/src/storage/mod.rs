//! `SQLite` session store for the `Hive` daemon.
//!
//! Holds the per-session `spawn_depth` written at spawn time, which takes
//! precedence over depth counted from the session key.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
