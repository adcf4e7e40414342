//! # gateway-relay
//!
//! A local, authenticating, credential-rewriting HTTP relay that lets
//! coding-agent CLIs route their model API traffic through an enterprise
//! workspace gateway.
//!
//! The agent CLI keeps sending its own vendor API key; the relay swaps a
//! valid gateway credential into `Authorization`, preserves the caller's key
//! under `x-anthropic-api-key`, and forwards the call — streaming responses
//! chunk-by-chunk. One relay instance serves one workspace; repeated
//! launches discover and reuse a compatible running instance via the health
//! endpoint.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gateway_relay::credentials::{CliTokenBroker, CredentialProvider};
//! use gateway_relay::{discovery, forward, server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workspace = "https://ws.example.com".to_string();
//!     let (port, running) = discovery::acquire_port(&workspace, discovery::WELL_KNOWN_PORT).await?;
//!     if running {
//!         return Ok(()); // a compatible relay already serves this workspace
//!     }
//!
//!     let state = server::AppState {
//!         provider: Arc::new(CredentialProvider::from_env(
//!             workspace.clone(),
//!             Arc::new(CliTokenBroker::default()),
//!         )),
//!         upstream: forward::upstream_client()?,
//!         workspace,
//!     };
//!     let listener = server::bind(port).await?;
//!     server::serve(listener, state).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod logging;
pub mod server;
pub mod transform;

pub use credentials::{CliTokenBroker, Credential, CredentialProvider, TokenBroker};
pub use error::{RelayError, Result};
pub use server::AppState;
