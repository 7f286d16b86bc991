//! Realtime session engine for the edge chat channel.
//!
//! This crate drives one authenticated session over MQTT-over-WebSocket:
//! it opens the transport, performs the connect, subscribe and initial sync
//! handshake, decodes inbound publishes into events, correlates `/ls_req`
//! tasks with their `/ls_resp` replies, and keeps the connection alive with
//! keepalives, heartbeats, watchdog probes and backoff driven reconnects.
//!
//! ## Features
//!
//! - **Bridge**: a [`Connector`] seam; [`WsConnector`] for real sockets
//!   (optionally through an HTTP proxy), [`MemoryConnector`] for tests
//! - **Engine**: a single task multiplexing commands, bridge signals and
//!   timers; consumers get an [`EventStream`] and an [`EngineHandle`]
//! - **Recovery**: error classification, exponential backoff with jitter,
//!   terminal logout and exhaustion events
//! - **Tasks**: request ids, pending replies and per-task result extraction
//!
//! ## Example
//!
//! ```rust,no_run
//! use msgr_session::{Cookie, Engine, EngineConfig, NoServices, SessionContext, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = SessionContext::new("1000", vec![Cookie::new("c_user", "1000")]);
//! let (handle, mut events) = Engine::start(
//!     ctx,
//!     EngineConfig::default(),
//!     Arc::new(WsConnector::new()),
//!     Arc::new(NoServices),
//! );
//!
//! while let Some(event) = events.next_event().await {
//!     println!("{}", event.kind());
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! let ctx = handle.stop().await?;
//! println!("resume from seq {}", ctx.cursor.last_seq_id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod reconnect;
pub mod services;
pub mod tasks;
pub mod timers;

// Re-export main types
pub use bridge::{BridgeSignal, BridgeStream, Connector, OpenRequest, WsConnector};
pub use config::EngineConfig;
pub use context::{Cookie, SessionContext, DEFAULT_USER_AGENT};
pub use engine::{Engine, EngineHandle, EventStream};
pub use error::{EngineError, ServiceError, TransportError};
pub use handshake::Handshake;
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use reconnect::{classify, Backoff, ConnectionState, ErrorClass, Reconnector};
pub use services::{HttpAccountProbe, NoServices, SessionServices};
pub use tasks::{TaskError, TaskRegistry, TaskResponse, TaskType};
pub use timers::{TimerKind, TimerRegistry};
