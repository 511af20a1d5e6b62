mod client;
pub mod webhook;

pub use client::JellyfinBackend;
