mod client;

pub use client::EmbyBackend;
