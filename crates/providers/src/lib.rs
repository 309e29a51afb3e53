//! Model gateway implementations for Anjia.
//!
//! All gateways implement the `anjia_core::ModelGateway` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatGateway;
