//! Packs a bucket of many small objects into a few large, compressed
//! archive volumes, streaming, resumable and with bounded memory.

pub mod config;
pub mod container;
pub mod db;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod services;
