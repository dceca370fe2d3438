//! aiui - provider-neutral chat orchestration.
//!
//! A request is routed to OpenAI, Gemini or a local Llama server based on
//! its model id, optionally preceded by a planning pass, and either
//! answered in one piece or streamed as thinking and response fragments
//! over server-sent events.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod persona;
pub mod server;
pub mod sse;
pub mod types;

#[cfg(test)]
mod test_support;
