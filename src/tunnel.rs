use crate::counting_stream::{CountingStream, PrependReader};
use crate::error::RequestError;
use crate::forward::{self, ProxyBody};
use crate::policy::{BoxedStream, PolicyDecision};
use crate::server::ConnContext;
use crate::upstream::{self, DialOptions};
use crate::url_utils::parse_host_header;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// The one reply a CONNECT client may key on, byte for byte.
pub(crate) const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Parsed head of a raw request (request line plus headers).
pub(crate) struct RequestHead {
  pub method: String,
  pub target: String,
  pub headers: Vec<(String, String)>,
}

impl RequestHead {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

pub(crate) fn parse_request_head(head: &[u8]) -> Option<RequestHead> {
  let text = std::str::from_utf8(head).ok()?;
  let mut lines = text.split("\r\n");
  let request_line = lines.next()?;
  let mut parts = request_line.split_whitespace();
  let method = parts.next()?.to_string();
  let target = parts.next()?.to_string();
  if !parts.next()?.starts_with("HTTP/") {
    return None;
  }

  let mut headers = Vec::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let (name, value) = line.split_once(':')?;
    headers.push((name.trim().to_string(), value.trim().to_string()));
  }
  Some(RequestHead {
    method,
    target,
    headers,
  })
}

/// Establish the target side of a tunnel: either a direct dial or a CONNECT
/// through the configured upstream proxy. The upstream's reply head is
/// reported to the server's CONNECT observer before the status is enforced.
pub(crate) async fn establish_tunnel_target(
  ctx: &ConnContext,
  decision: &PolicyDecision,
  hostname: &str,
  port: u16,
) -> Result<BoxedStream, RequestError> {
  let dial_options = DialOptions {
    dns: decision.dns_lookup.clone(),
    local_address: decision.local_address,
    timeout: ctx.core.options.connect_timeout,
  };

  match &decision.upstream_proxy_url {
    Some(raw) => {
      let upstream = upstream::validate_upstream_url(raw)
        .map_err(|e| RequestError::UpstreamMisconfigured(e.to_string()))?;
      let agent = if upstream.scheme.as_deref() == Some("https") {
        decision.https_agent.as_ref()
      } else {
        decision.http_agent.as_ref()
      };
      let mut stream = upstream::open_upstream_stream(
        &upstream,
        agent,
        decision.ignore_upstream_proxy_certificate,
        &dial_options,
      )
      .await?;

      let (reply, leftover) =
        upstream::connect_via_upstream(&mut stream, hostname, port, &upstream).await?;
      ctx.notify_connect_observer(&reply);
      if reply.status != 200 {
        return Err(RequestError::UpstreamBadStatus {
          status: reply.status,
          reason: reply.reason,
        });
      }
      if leftover.is_empty() {
        Ok(stream)
      } else {
        Ok(Box::new(PrependReader::new(leftover, stream)))
      }
    }
    None => {
      let tcp = forward::dial_tcp_for_target(hostname, port, &dial_options).await?;
      Ok(Box::new(tcp))
    }
  }
}

/// CONNECT received as the first request on a fresh connection. The reply is
/// written at the socket level so its bytes are exactly
/// `HTTP/1.1 200 Connection Established\r\n\r\n`, and the socket never
/// re-enters the HTTP parser afterwards.
pub(crate) async fn handle_connect_raw<S>(
  ctx: Arc<ConnContext>,
  mut client: CountingStream<S>,
  head: Vec<u8>,
  client_leftover: Vec<u8>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let parsed = match parse_request_head(&head) {
    Some(parsed) if parsed.method == "CONNECT" => parsed,
    _ => {
      let err = RequestError::BadRequest("malformed CONNECT request".to_string());
      ctx.report_failure(&err);
      write_raw_error(&mut client, &err, &ctx.core.options.auth_realm).await;
      return;
    }
  };

  let (hostname, port) = match parse_host_header(&parsed.target) {
    Some(target) => (target.hostname, target.port.unwrap_or(443)),
    None => {
      let err = RequestError::BadRequest(format!("invalid CONNECT target: {}", parsed.target));
      ctx.report_failure(&err);
      write_raw_error(&mut client, &err, &ctx.core.options.auth_realm).await;
      return;
    }
  };

  let policy_request = ctx.policy_request(
    "CONNECT",
    &hostname,
    port,
    true,
    parsed.header("proxy-authorization"),
  );
  let decision = match ctx.evaluate_policy(&policy_request).await {
    Ok(decision) => decision,
    Err(err) => {
      ctx.report_failure(&err);
      write_raw_error(&mut client, &err, &ctx.core.options.auth_realm).await;
      return;
    }
  };

  if decision.require_authentication {
    let realm = decision
      .realm
      .clone()
      .unwrap_or_else(|| ctx.core.options.auth_realm.clone());
    write_raw_error(
      &mut client,
      &RequestError::AuthRequired { realm },
      &ctx.core.options.auth_realm,
    )
    .await;
    return;
  }

  if decision.custom_response.is_some() {
    let err =
      RequestError::PolicyHookFailed("custom responses cannot be served for CONNECT".to_string());
    ctx.report_failure(&err);
    write_raw_error(&mut client, &err, &ctx.core.options.auth_realm).await;
    return;
  }

  let target = match establish_tunnel_target(&ctx, &decision, &hostname, port).await {
    Ok(target) => target,
    Err(err) => {
      ctx.report_failure(&err);
      write_raw_error(&mut client, &err, &ctx.core.options.auth_realm).await;
      return;
    }
  };

  if client.write_all(CONNECT_ESTABLISHED).await.is_err() || client.flush().await.is_err() {
    ctx.report_failure(&RequestError::ClientGone(
      "client closed before tunnel established".to_string(),
    ));
    return;
  }

  let mut target = CountingStream::new(target, ctx.counters.trg_rx.clone(), ctx.counters.trg_tx.clone());

  // Bytes the client sent past the CONNECT head belong to the tunnel.
  if !client_leftover.is_empty() && target.write_all(&client_leftover).await.is_err() {
    return;
  }

  relay(&mut client, &mut target, &ctx.abort).await;
}

/// CONNECT arriving on a kept-alive socket goes through hyper's upgrade
/// mechanism instead of the raw fast path; tunnel semantics are identical.
pub(crate) async fn handle_connect_upgrade(
  ctx: Arc<ConnContext>,
  mut req: Request<Incoming>,
) -> Response<ProxyBody> {
  let authority = match req.uri().authority() {
    Some(authority) => authority.as_str().to_string(),
    None => {
      return forward::error_response(
        &ctx,
        &RequestError::BadRequest("CONNECT requires host:port".to_string()),
      )
    }
  };
  let (hostname, port) = match parse_host_header(&authority) {
    Some(target) => (target.hostname, target.port.unwrap_or(443)),
    None => {
      return forward::error_response(
        &ctx,
        &RequestError::BadRequest(format!("invalid CONNECT target: {authority}")),
      )
    }
  };

  let auth_header = req
    .headers()
    .get(PROXY_AUTHORIZATION)
    .and_then(|v| v.to_str().ok());
  let policy_request = ctx.policy_request("CONNECT", &hostname, port, true, auth_header);
  let decision = match ctx.evaluate_policy(&policy_request).await {
    Ok(decision) => decision,
    Err(err) => return forward::error_response(&ctx, &err),
  };

  if decision.require_authentication {
    let realm = decision
      .realm
      .clone()
      .unwrap_or_else(|| ctx.core.options.auth_realm.clone());
    return forward::error_response(&ctx, &RequestError::AuthRequired { realm });
  }

  if decision.custom_response.is_some() {
    return forward::error_response(
      &ctx,
      &RequestError::PolicyHookFailed("custom responses cannot be served for CONNECT".to_string()),
    );
  }

  let target = match establish_tunnel_target(&ctx, &decision, &hostname, port).await {
    Ok(target) => target,
    Err(err) => return forward::error_response(&ctx, &err),
  };

  let tunnel_ctx = ctx.clone();
  let handle = tokio::spawn(async move {
    match hyper::upgrade::on(&mut req).await {
      Ok(upgraded) => {
        let mut client = TokioIo::new(upgraded);
        let mut target = CountingStream::new(
          target,
          tunnel_ctx.counters.trg_rx.clone(),
          tunnel_ctx.counters.trg_tx.clone(),
        );
        relay(&mut client, &mut target, &tunnel_ctx.abort).await;
      }
      Err(e) => {
        log::debug!("connection {}: upgrade failed: {e}", tunnel_ctx.id);
      }
    }
  });
  ctx.set_tunnel_task(handle);

  let mut response = Response::new(forward::full_body(""));
  *response.status_mut() = StatusCode::OK;
  response
    .extensions_mut()
    .insert(ReasonPhrase::from_static(b"Connection Established"));
  response
}

/// Copy both directions until both are done. EOF in one direction propagates
/// as a write-side shutdown to the peer; an error or a forced close tears
/// both sockets down.
pub(crate) async fn relay<A, B>(client: &mut A, target: &mut B, abort: &CancellationToken)
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  tokio::select! {
    result = tokio::io::copy_bidirectional(client, target) => match result {
      Ok((to_target, to_client)) => {
        log::debug!("tunnel drained: {to_target} bytes out, {to_client} bytes back");
      }
      Err(e) => {
        log::debug!("tunnel torn down: {e}");
      }
    },
    _ = abort.cancelled() => {
      log::debug!("tunnel force-closed");
    }
  }
}

/// Write an error reply on the raw (pre-parser) path. Upstream CONNECT
/// rejections are forwarded as a bare status line so the client sees the
/// upstream's own status; everything else gets a minimal closing response.
async fn write_raw_error<S>(stream: &mut S, err: &RequestError, fallback_realm: &str)
where
  S: AsyncWrite + Unpin,
{
  let payload = match err {
    RequestError::UpstreamBadStatus { status, reason } => {
      format!("HTTP/1.1 {status} {reason}\r\n\r\n")
    }
    RequestError::AuthRequired { realm } => {
      let realm = if realm.is_empty() { fallback_realm } else { realm };
      format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"{realm}\"\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
      )
    }
    other => {
      let body = other.to_string();
      format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        other.status().as_u16(),
        other.reason(),
        body.len(),
        body
      )
    }
  };
  let _ = stream.write_all(payload.as_bytes()).await;
  let _ = stream.flush().await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_request_head() {
    let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dTpw\r\n\r\n";
    let parsed = parse_request_head(head).unwrap();
    assert_eq!(parsed.method, "CONNECT");
    assert_eq!(parsed.target, "example.com:443");
    assert_eq!(parsed.header("PROXY-AUTHORIZATION"), Some("Basic dTpw"));
    assert_eq!(parsed.header("missing"), None);
  }

  #[test]
  fn test_parse_request_head_rejects_garbage() {
    assert!(parse_request_head(b"not an http request\r\n\r\n").is_none());
    assert!(parse_request_head(b"GET /\r\n\r\n").is_none());
  }

  #[tokio::test]
  async fn test_relay_half_close() {
    let (mut a_local, a_remote) = tokio::io::duplex(64);
    let (mut b_local, b_remote) = tokio::io::duplex(64);
    let abort = CancellationToken::new();

    let relay_task = tokio::spawn(async move {
      let mut client = a_remote;
      let mut target = b_remote;
      relay(&mut client, &mut target, &abort).await;
    });

    use tokio::io::AsyncReadExt;
    a_local.write_all(b"hello").await.unwrap();
    a_local.shutdown().await.unwrap();

    let mut received = [0u8; 5];
    b_local.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"hello");

    b_local.write_all(b"world").await.unwrap();
    b_local.shutdown().await.unwrap();

    let mut back = Vec::new();
    a_local.read_to_end(&mut back).await.unwrap();
    assert_eq!(back, b"world");

    relay_task.await.unwrap();
  }
}
