//! Serve - manage local Caddy-backed web servers
//!
//! This library lets callers define named static-file servers and run them:
//! - Server definitions (id, root directory, port) with a key-value exchange format
//! - Caddyfile generation and forgiving parsing of hand-edited files
//! - One directory per server holding its Caddyfile and logs, written atomically
//! - Supervision of one Caddy process per server with graceful stop and escalation
//! - Broadcasting of `Running`/`Stopped` transitions to any number of subscribers
//! - Locked pid files so separate serve processes can see and stop each other's servers

pub mod caddyfile;
pub mod config;
pub mod error;
pub mod layout;
pub mod notify;
pub mod pidfile;
pub mod process;
pub mod server;

pub use error::{Result, ServeError};
pub use notify::{Status, StatusEvent, StatusNotifier};
pub use process::{ProcessManager, ShutdownReport};
pub use server::ServerDefinition;
