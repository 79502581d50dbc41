//! Mailclerk — mail-to-Notion ingestion service.

pub mod analysis;
pub mod config;
pub mod error;
pub mod http;
pub mod mailbox;
pub mod notion;
pub mod pipeline;
pub mod scheduler;
pub mod settings;
pub mod store;
