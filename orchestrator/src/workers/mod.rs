//! Background workers

pub mod controller;
pub mod watcher;
