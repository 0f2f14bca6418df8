//! Chaining HTTP/HTTPS forward proxy.
//!
//! The server accepts client traffic, runs each request through an optional
//! policy hook, and forwards it either directly to its origin or through a
//! chained upstream proxy, while accounting for bytes and connection
//! lifecycle. CONNECT tunnels are relayed opaquely. The [`anonymizer`] module
//! wraps an authenticated upstream proxy in an ephemeral local endpoint with
//! no authentication, hiding the upstream credentials from downstream
//! clients.

pub mod anonymizer;
pub mod counting_stream;
pub mod error;
pub mod events;
mod forward;
pub mod policy;
pub mod registry;
pub mod server;
pub mod tls;
mod tunnel;
pub mod upstream;
pub mod url_utils;

pub use anonymizer::{
  anonymize_proxy, anonymize_proxy_with, close_anonymized_proxy, listen_connect_anonymized_proxy,
  AnonymizeOptions,
};
pub use error::{ProxyError, RequestError};
pub use events::ServerEvent;
pub use policy::{
  CustomResponder, CustomResponse, Dialer, DnsResolve, FnPolicy, PolicyDecision, PolicyRequest,
  RequestPolicy,
};
pub use registry::ConnectionStats;
pub use server::{ProxyServer, ServerKind, ServerOptions};
pub use tls::TlsIdentity;
pub use upstream::{ConnectObserver, ConnectReplyInfo};
pub use url_utils::{parse_host_header, parse_proxy_url, redact_url, ProxyUrl};
