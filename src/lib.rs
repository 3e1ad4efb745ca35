//! Drover bridges an interactive child process to WebSocket clients.
//! Prompts detected in the child's output are relayed to subscribers and
//! their replies are written back to its stdin; runs beyond the concurrency
//! cap wait in a FIFO queue.

pub mod classify;
pub mod cli;
pub mod config;
pub mod events;
pub mod foreground;
pub mod hub;
pub mod log;
pub mod paths;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod shell_completion;
pub mod store;
pub mod tags;
