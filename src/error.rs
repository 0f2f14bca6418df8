use hyper::StatusCode;

/// Errors surfaced by public entry points before any socket work starts
/// (URL validation, port allocation, listener setup).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
  #[error("invalid URL: {0}")]
  InvalidUrl(String),

  #[error("unsupported protocol: {0}")]
  UnsupportedProtocol(String),

  #[error("no free ports available in range {lo}-{hi}")]
  NoFreePorts { lo: u16, hi: u16 },

  #[error("failed to listen on {addr}: {source}")]
  ListenFailed {
    addr: String,
    #[source]
    source: std::io::Error,
  },

  #[error("TLS configuration error: {0}")]
  TlsConfig(String),

  #[error("unknown anonymized proxy: {0}")]
  UnknownProxy(String),
}

/// Per-request failures. Each kind maps to the status code the client sees,
/// unless response headers were already sent (then the connection is destroyed).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
  #[error("proxy authentication required")]
  AuthRequired { realm: String },

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("policy hook failed: {0}")]
  PolicyHookFailed(String),

  #[error("could not resolve target host {0}")]
  TargetDnsFailed(String),

  #[error("could not connect to target {0}: {1}")]
  TargetConnectFailed(String, std::io::Error),

  #[error("timed out connecting to target {0}")]
  TargetTimeout(String),

  #[error("could not resolve upstream proxy host {0}")]
  UpstreamDnsFailed(String),

  #[error("could not connect to upstream proxy {0}: {1}")]
  UpstreamConnectFailed(String, String),

  #[error("upstream proxy refused CONNECT with status {status}")]
  UpstreamBadStatus {
    status: u16,
    reason: String,
  },

  #[error("upstream proxy rejected the supplied credentials")]
  AuthRejectedByUpstream,

  #[error("invalid upstream proxy URL: {0}")]
  UpstreamMisconfigured(String),

  #[error("client disconnected: {0}")]
  ClientGone(String),
}

/// Status code for DNS failures on the upstream-proxy side. Non-standard on
/// purpose so operators can tell them apart from origin-side failures.
pub const STATUS_UPSTREAM_DNS_FAILED: u16 = 593;

impl RequestError {
  /// The status code sent to the client when the error occurs before any
  /// response bytes have been written.
  pub fn status(&self) -> StatusCode {
    match self {
      RequestError::AuthRequired { .. } => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
      RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
      RequestError::PolicyHookFailed(_) | RequestError::UpstreamMisconfigured(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
      RequestError::TargetDnsFailed(_) => StatusCode::NOT_FOUND,
      RequestError::TargetConnectFailed(_, _) => StatusCode::BAD_GATEWAY,
      RequestError::TargetTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
      RequestError::UpstreamDnsFailed(_) => {
        StatusCode::from_u16(STATUS_UPSTREAM_DNS_FAILED).unwrap_or(StatusCode::BAD_GATEWAY)
      }
      RequestError::UpstreamConnectFailed(_, _) | RequestError::AuthRejectedByUpstream => {
        StatusCode::BAD_GATEWAY
      }
      RequestError::UpstreamBadStatus { status, .. } => {
        StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
      }
      // No reply is possible; the mapping exists only for logging.
      RequestError::ClientGone(_) => StatusCode::BAD_GATEWAY,
    }
  }

  /// Reason phrase for the raw (pre-HTTP-parser) reply path.
  pub fn reason(&self) -> &str {
    match self {
      RequestError::AuthRequired { .. } => "Proxy Authentication Required",
      RequestError::BadRequest(_) => "Bad Request",
      RequestError::PolicyHookFailed(_) | RequestError::UpstreamMisconfigured(_) => {
        "Internal Server Error"
      }
      RequestError::TargetDnsFailed(_) => "Not Found",
      RequestError::TargetConnectFailed(_, _) => "Bad Gateway",
      RequestError::TargetTimeout(_) => "Gateway Timeout",
      RequestError::UpstreamDnsFailed(_) => "Upstream DNS Failure",
      RequestError::UpstreamConnectFailed(_, _) | RequestError::AuthRejectedByUpstream => {
        "Bad Gateway"
      }
      RequestError::UpstreamBadStatus { reason, .. } => reason,
      RequestError::ClientGone(_) => "Bad Gateway",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(
      RequestError::TargetDnsFailed("x".into()).status(),
      StatusCode::NOT_FOUND
    );
    assert_eq!(
      RequestError::TargetTimeout("x".into()).status(),
      StatusCode::GATEWAY_TIMEOUT
    );
    assert_eq!(
      RequestError::UpstreamDnsFailed("x".into()).status().as_u16(),
      593
    );
    assert_eq!(
      RequestError::UpstreamBadStatus {
        status: 401,
        reason: "UNAUTHORIZED".into()
      }
      .status(),
      StatusCode::UNAUTHORIZED
    );
  }
}
