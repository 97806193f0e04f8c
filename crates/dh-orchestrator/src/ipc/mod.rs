//! Control IPC server for CLI/GUI communication
//!
//! A Unix socket only the owning user can open. Front ends send one JSON
//! request per line and read one JSON response per line; subscribed
//! connections also receive events.

mod server;

pub use server::IpcServer;
