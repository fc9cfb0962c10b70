//! HTTP networking module
//!
//! Provides the HTTP client and the shared request gate used by the remote backend.

mod client;
mod gate;

pub use client::{HttpClient, HttpMethod, ServiceRequest, ServiceResponse};
pub use gate::RequestGate;
