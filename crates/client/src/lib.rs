//! HTTP gateway to a remote process engine
//!
//! [`EngineClient`] implements [`extask_core::RemoteTaskGateway`] over the
//! engine's external task REST API:
//!
//! | operation               | endpoint                                  |
//! |-------------------------|-------------------------------------------|
//! | `claim_batch`           | `POST {base}/external-task/fetchAndLock`  |
//! | `report_success`        | `POST {base}/external-task/{id}/complete` |
//! | `report_failure`        | `POST {base}/external-task/{id}/failure`  |
//! | `report_business_error` | `POST {base}/external-task/{id}/bpmnError`|
//!
//! Reports answer `true` only for HTTP 204. Non-2xx responses become
//! [`GatewayError::Remote`](extask_core::GatewayError::Remote) carrying the
//! engine's `type` and `message`.
//!
//! ## Example
//!
//! ```ignore
//! use extask_client::{Auth, ClientConfig, EngineClient};
//!
//! let config = ClientConfig::new("http://localhost:8080/engine-rest")
//!     .with_auth(Auth::basic("demo", "demo"));
//! config.validate_for(&worker_config)?;
//! let gateway = Arc::new(EngineClient::new(&config)?);
//! ```

mod auth;
mod client;
mod config;

pub use auth::Auth;
pub use client::EngineClient;
pub use config::{ClientConfig, DEFAULT_BASE_URL};
