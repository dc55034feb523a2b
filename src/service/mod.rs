//! # Control Service
//!
//! Newline-delimited JSON over a Unix stream socket, exposing the resource
//! store and the hot-plug orchestrator to local callers.
//!
//! ```text
//! ┌────────────────┐  {"action":"create_controller",...}\n  ┌────────────────┐
//! │ ControlClient  │ ──────────────────────────────────────► │ ControlServer  │
//! │                │ ◄────────────────────────────────────── │  HotplugServer │
//! └────────────────┘  {"status":"ok","data":{...}}\n          └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Request/response types
//! - [`server`]: Socket listener and request dispatch
//! - [`client`]: Async client

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ControlClient, ControlError, ControlResult};
pub use protocol::{Request, Response, ResponseData};
pub use server::{ControlServer, handle_request};
