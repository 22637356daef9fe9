//! agentdeck: a multi-runtime agent session layer.
//!
//! Adapters drive external coding-agent runtimes ([`backend`]), raw runtime
//! events are persisted and normalized into runtime-agnostic entries
//! ([`normalize`], [`storage`]) by the session [`orchestrator`], and
//! presentation code consumes the outward [`events`] stream through the
//! [`timeline`] cache and the [`display`] merger.
//!
//! # Quick start
//!
//! ```no_run
//! use agentdeck::backend::{BackendRegistry, ClaudeBackend, CallbackRuntime};
//! use agentdeck::events::EventEmitter;
//! use agentdeck::orchestrator::{Orchestrator, StartRequest};
//! use agentdeck::storage::FileStore;
//! use agentdeck::types::BackendKind;
//! use std::sync::Arc;
//!
//! # async fn example(runtime: Arc<dyn CallbackRuntime>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::open("/tmp/agentdeck")?);
//! let (emitter, mut events) = EventEmitter::channel();
//! let backends = BackendRegistry::new().with(Arc::new(ClaudeBackend::new(runtime)));
//! let orchestrator = Orchestrator::new(backends, store, emitter);
//! orchestrator
//!     .start(StartRequest::new("task-1", BackendKind::ClaudeCode, "/work", "fix the build"))
//!     .await?;
//! while let Some(envelope) = events.recv().await {
//!     println!("{envelope:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod config;
pub mod display;
pub mod error;
pub mod events;
pub mod normalize;
pub mod orchestrator;
pub mod replay;
pub mod storage;
#[cfg(test)]
pub mod testsupport;
pub mod textutil;
pub mod timeline;
pub mod types;
