//! rollcall-api — Remote clients for Rollcall.
//!
//! [`ApiClient`] talks to the stored-procedure HTTP API that owns rosters,
//! accounts and remote configuration. [`inference::RemoteFaceEngine`] forwards
//! the face-engine façade to an HTTP inference service.

pub mod client;
pub mod config;
pub mod error;
pub mod inference;
pub mod procedures;
pub mod session;

pub use client::{ApiClient, Params, ResultSets, Row};
pub use config::ApiConfig;
pub use error::ApiError;
pub use procedures::{LoginRows, RosterDiff, RosterEntry};
pub use session::{CurrentUser, SessionCell};
