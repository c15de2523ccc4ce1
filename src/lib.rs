//! Batch sign-in activity audit for directory accounts.
//!
//! Resolves a batch of user identifiers (from a CSV file or a group
//! membership lookup), queries the directory API for each user's last
//! sign-in, classifies it against a day threshold, and exports a CSV report.
//!
//! # Modules
//!
//! - `auth`: authenticated session (interactive flow, device-code fallback)
//! - `client`: directory API wrapper with retry/backoff
//! - `input`: input resolution from file or group
//! - `classify`: the recent-sign-in predicate
//! - `runner`: sequential batch orchestration with progress events
//! - `report`: CSV export with backup and fallback semantics

pub mod auth;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod input;
pub mod models;
pub mod report;
pub mod runner;

pub use auth::Session;
pub use client::GraphClient;
pub use config::{AuthConfig, InputMode, RunConfig};
pub use error::{AuditError, LookupError, ReportError};
pub use models::{BatchReport, ClassifiedRecord, LookupOutcome, UserRecord};
pub use runner::Progress;
