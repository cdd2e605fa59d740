pub mod config;
pub mod display;
pub mod error;
pub mod http;
pub mod llm;
pub mod mcp;
pub mod runner;
