pub mod clients;
pub mod config;
pub mod handler;
pub mod models;
pub mod utils;
