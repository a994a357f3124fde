//! Location Setup - register a cloud location with topo from operator input.
//!
//! # Flow
//!
//! ```text
//! SetupRequest (subscription, certificate, passwords)
//!          ↓
//!     validate fields
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │   ComputeServiceFactory::connect         │
//! │   list assignable locations (>= 1)       │  nothing written yet
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │   move certificate into home dir         │
//! │   write topo.properties (0600, atomic)   │  certificate moved back
//! │   reload hook                            │  on any failure here
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Core Types
//!
//! - [`LocationSetup`] - Runs a setup and reports [`LocationStatus`]
//! - [`ComputeServiceFactory`] - Opens a provider connection for credentials
//! - [`Properties`] - The properties file format

mod properties;
mod setup;

pub use properties::Properties;
pub use setup::{
    ComputeServiceFactory, LocationDefaults, LocationSetup, LocationStatus, ProviderCredentials,
    ReloadHook, SetupError, SetupOutcome, SetupRequest, CERTIFICATE_FILE, PROPERTIES_FILE,
};
