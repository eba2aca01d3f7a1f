#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

//! `fabula`: a conversational long-form-fiction authoring engine.
//!
//! The user converses in natural language; the engine silently maintains
//! the story's settings (characters, world, plot threads, style) in a
//! layered memory and produces chapter prose that stays consistent across
//! an arbitrarily long work.
//!
//! The library surface is the agent API:
//!
//! ```no_run
//! use fabula::agent::{AgentContext, ConversationalAgent};
//! use fabula::config::Config;
//! use fabula::llm::{create_provider, LlmGateway};
//! use fabula::memory::{create_embedding_provider, InMemoryVectorIndex};
//! use fabula::storage::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let provider = create_provider(&config)?;
//! let gateway = Arc::new(LlmGateway::new(provider, &config));
//! let store = Arc::new(InMemoryStore::new());
//! let vectors = Arc::new(InMemoryVectorIndex::new());
//! let embedder: Arc<dyn fabula::memory::EmbeddingProvider> = create_embedding_provider(
//!     &config.memory.embedding_provider,
//!     config.api_key.as_deref(),
//!     &config.memory.embedding_model,
//!     config.memory.embedding_dims,
//! )
//! .into();
//!
//! let agent = ConversationalAgent::new(AgentContext::new(
//!     config, store, gateway, vectors, embedder,
//! ));
//! let reply = agent
//!     .chat(None, "I want a cyberpunk novel set in Shanghai", None)
//!     .await;
//! println!("{}", reply.text);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod consistency;
pub mod error;
pub mod generation;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod session;
pub mod settings;
pub mod storage;

pub use agent::{AgentContext, ChatEvent, ChatReply, ConversationalAgent};
pub use config::Config;
pub use error::{ErrorKind, FabulaError, Result};
