//! Core of the manifold MCP aggregation gateway.
//!
//! One process fans in many backend MCP servers (stdio subprocesses, SSE
//! servers, streamable-HTTP servers) and presents their merged capability
//! catalog upstream. This crate is the bridge: backend session lifecycle,
//! capability aggregation and conflict resolution, the per-request
//! middleware pipeline, health monitoring, audit, and hot reload. The wire
//! transports on both sides live in the `manifold-gateway` binary and talk
//! to this crate through [`Bridge`].

pub mod audit;
pub mod authz;
mod bridge;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod conflict;
pub mod health;
pub mod manager;
pub mod middleware;
pub mod registry;
pub mod reload;
pub mod session;
pub mod sessions;
pub mod status;

pub use bridge::{Bridge, CapabilitiesSnapshot, RouteView, StatusSnapshot};
pub use capability::{CapabilityKind, CapabilityRecord};
pub use config::BridgeConfig;
pub use context::{McpMethod, RequestContext, UserIdentity};
pub use error::{BridgeError, ErrorKind};
pub use manager::ReconnectReport;
pub use reload::ReloadReport;
