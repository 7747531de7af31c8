#![deny(clippy::unwrap_used)]

use refinery::embed_migrations;

pub mod adapters;
pub mod archive;
pub mod browser;
pub mod config;
pub mod core;
pub mod credentials;
pub mod dates;
pub mod db;
pub mod download;
pub mod manifest;
pub mod xml;

embed_migrations!("./migrations");
