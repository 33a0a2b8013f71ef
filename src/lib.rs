//! # NL-SQL Agent
//!
//! Answers natural-language questions about a sales database.
//!
//! This library provides:
//! - A ReAct agent loop driven by a fine-tuned language model
//! - A schema retrieval tool backed by embeddings and a vector index
//! - A guarded, read-only SQL execution tool
//! - An HTTP API and a terminal REPL on top of the agent
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Receive a question
//! 2. Build context with the system prompt and the tool reference
//! 3. Call the model, parse its `Thought` / `Action` / `Answer` reply, run any tool
//! 4. Feed the observation back to the model, repeat until it answers
//!
//! ## Example
//!
//! ```rust,ignore
//! use nl_sql_agent::{agent::Agent, config::Config};
//!
//! let config = Config::from_env()?;
//! let agent = Agent::from_config(&config).await?;
//! let answer = agent.answer("What are total sales by region?").await;
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod embedding;
pub mod llm;
pub mod retry;
pub mod tools;
pub mod vector_index;

pub use config::Config;
