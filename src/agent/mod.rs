//! AI calculation gateway.
//!
//! `gateway` defines the seam used by the core; `ollama` implements it
//! against a local or remote Ollama server.

pub mod gateway;
pub mod ollama;

pub use gateway::{
    Calculation, CalculationContext, CalculationGateway, DisabledGateway, GatewayError,
};
pub use ollama::{OllamaConfig, OllamaGateway};
