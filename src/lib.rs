//! # Qmesh - Store-and-Forward Chat for Half-Duplex Radio Meshes
//!
//! Qmesh is an IRC-style chat service carried over multi-hop, low-bandwidth
//! radio links (an ARDOP-style modem TCP port, or an authenticated TCP
//! substitute). Every node floods route advertisements, forwards data frames
//! for its neighbors, and heals message gaps with bounded sync requests.
//!
//! ## Features
//!
//! - **BATMAN-lite Routing**: Periodic originator messages (OGMs) build
//!   per-destination next-hop tables over a broadcast medium.
//! - **At-Most-Once Delivery**: A time-bounded `(origin, seqno)` dedup cache
//!   guarantees each data frame is processed once no matter how many flooded
//!   copies arrive.
//! - **Gap Recovery**: Per-origin sequence tracking detects missing ranges,
//!   confirms them against reordering, and issues bounded range-sync requests
//!   with capped retries.
//! - **Multi-Link Operation**: A radio modem link and any number of TCP peer
//!   links can run side by side behind one multiplexer.
//! - **Compact Wire Protocol**: Binary chat framing with zlib compression and
//!   an optional (off by default) AES-GCM layer.
//! - **Async Design**: Built with Tokio for predictable behavior on
//!   constrained hardware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qmesh::chat::{ChatCallbacks, ChatService};
//! use qmesh::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut service = ChatService::new(config, ChatCallbacks::default())?;
//!     service.start().await?;
//!     // ... run until shutdown ...
//!     service.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`link`] - Link-layer framing, reconnecting clients, multiplexing
//! - [`mesh`] - Flood-routing engine: OGMs, forwarding, dedup, crypto
//! - [`chat`] - Chat wire protocol and the chat service glue
//! - [`sync`] - Gap detection, sync policy, and the retry scheduler
//! - [`storage`] - Persisted message history
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Chat Service   │ ← protocol, store, sync recovery
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Mesh Routing   │ ← OGMs, forwarding, dedup
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Link Layer    │ ← framing, reconnect, multiplex
//! └─────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod link;
pub mod logutil;
pub mod mesh;
pub mod storage;
pub mod sync;
