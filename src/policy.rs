use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can carry a proxied byte stream. Dialers return these so a
/// caller-owned pool can hand out plain TCP, TLS, or anything else.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-owned connection pool. The engine dials through it and performs one
/// HTTP/1.1 handshake per outbound request on whatever stream it returns;
/// keep-alive reuse across requests is the pool's business. The engine never
/// shuts a dialer down.
#[async_trait]
pub trait Dialer: Send + Sync {
  async fn dial(&self, hostname: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Custom name resolution, applied to both direct-to-origin and
/// upstream-proxy dials. Implementations may return IPv4 or IPv6 addresses.
#[async_trait]
pub trait DnsResolve: Send + Sync {
  async fn resolve(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

/// What the engine tells the policy hook about a request.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
  pub connection_id: u64,
  pub peer_addr: SocketAddr,
  /// Request method; `CONNECT` for tunnel requests.
  pub method: String,
  pub target_hostname: String,
  pub target_port: u16,
  /// True for CONNECT tunnels, false for forwarded HTTP requests.
  pub is_tunnel: bool,
  /// Credentials decoded from `Proxy-Authorization`, if the client sent any.
  pub username: Option<String>,
  pub password: Option<String>,
}

/// A short-circuit response produced instead of dialing any target.
#[derive(Debug, Clone)]
pub struct CustomResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Default for CustomResponse {
  fn default() -> Self {
    Self {
      status: 200,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }
}

#[async_trait]
pub trait CustomResponder: Send + Sync {
  async fn respond(&self, request: &PolicyRequest) -> CustomResponse;
}

/// The policy hook's verdict for one request.
///
/// The default decision forwards directly to the origin with no
/// authentication requirement and no custom behavior.
#[derive(Clone, Default)]
pub struct PolicyDecision {
  /// Reject the client with 407 and a `Proxy-Authenticate` challenge.
  pub require_authentication: bool,
  /// Challenge realm; the server's configured realm applies when unset.
  pub realm: Option<String>,
  /// Chain through this upstream proxy (`http://` or `https://`, explicit
  /// port required).
  pub upstream_proxy_url: Option<String>,
  /// Disable certificate verification toward the upstream proxy only.
  pub ignore_upstream_proxy_certificate: bool,
  /// Short-circuit the request without dialing a target.
  pub custom_response: Option<Arc<dyn CustomResponder>>,
  /// Injected pool for plain-TCP dials.
  pub http_agent: Option<Arc<dyn Dialer>>,
  /// Injected pool for TLS dials.
  pub https_agent: Option<Arc<dyn Dialer>>,
  /// Custom resolution for origin and upstream hostnames.
  pub dns_lookup: Option<Arc<dyn DnsResolve>>,
  /// Bind outbound connections to this local address.
  pub local_address: Option<IpAddr>,
}

impl std::fmt::Debug for PolicyDecision {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PolicyDecision")
      .field("require_authentication", &self.require_authentication)
      .field("realm", &self.realm)
      .field("upstream_proxy_url", &self.upstream_proxy_url)
      .field(
        "ignore_upstream_proxy_certificate",
        &self.ignore_upstream_proxy_certificate,
      )
      .field("custom_response", &self.custom_response.is_some())
      .field("http_agent", &self.http_agent.is_some())
      .field("https_agent", &self.https_agent.is_some())
      .field("dns_lookup", &self.dns_lookup.is_some())
      .field("local_address", &self.local_address)
      .finish()
  }
}

/// Per-request inspection hook. Runs to completion before any forwarding
/// begins; an error is reported to the client as 500.
#[async_trait]
pub trait RequestPolicy: Send + Sync {
  async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, BoxError>;
}

/// Adapter so plain async closures can serve as policies:
///
/// ```ignore
/// let policy = FnPolicy(|req: PolicyRequest| async move {
///   Ok(PolicyDecision { upstream_proxy_url: Some(upstream.clone()), ..Default::default() })
/// });
/// ```
pub struct FnPolicy<F>(pub F);

#[async_trait]
impl<F, Fut> RequestPolicy for FnPolicy<F>
where
  F: Fn(PolicyRequest) -> Fut + Send + Sync,
  Fut: Future<Output = Result<PolicyDecision, BoxError>> + Send + 'static,
{
  async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, BoxError> {
    (self.0)(request.clone()).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_fn_policy_adapter() {
    let policy = FnPolicy(|req: PolicyRequest| async move {
      let mut decision = PolicyDecision::default();
      decision.require_authentication = req.username.is_none();
      Result::<PolicyDecision, BoxError>::Ok(decision)
    });

    let request = PolicyRequest {
      connection_id: 1,
      peer_addr: "127.0.0.1:9999".parse().unwrap(),
      method: "GET".to_string(),
      target_hostname: "example.com".to_string(),
      target_port: 80,
      is_tunnel: false,
      username: None,
      password: None,
    };
    let decision = policy.evaluate(&request).await.unwrap();
    assert!(decision.require_authentication);
  }
}
