//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite connection pool and migrations
//! - Federation graph (actors, objects, activities, collections, follows)
//! - Host content model (users, categories, topics, posts, likes)

pub mod content;
mod database;
mod models;
pub mod store;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
