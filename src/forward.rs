use crate::error::RequestError;
use crate::policy::BoxedStream;
use crate::server::ConnContext;
use crate::upstream::{self, DialError, DialOptions};
use crate::url_utils::{self, ProxyUrl};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
  Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build the client-facing response for a failed request and surface the
/// failure on the event bus. 407 challenges are normal auth flow and are not
/// reported as failures.
pub(crate) fn error_response(ctx: &ConnContext, err: &RequestError) -> Response<ProxyBody> {
  if !matches!(err, RequestError::AuthRequired { .. }) {
    ctx.report_failure(err);
  }

  let mut builder = Response::builder().status(err.status());
  if let RequestError::AuthRequired { realm } = err {
    builder = builder.header(
      PROXY_AUTHENTICATE,
      format!("Basic realm=\"{realm}\""),
    );
  }
  builder
    .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
    .body(full_body(err.to_string()))
    .unwrap_or_else(|_| {
      let mut fallback = Response::new(full_body("internal error"));
      *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
      fallback
    })
}

/// Handle a forwarded (absolute-URI) HTTP request inside the hyper service.
pub(crate) async fn handle_forward(
  ctx: Arc<ConnContext>,
  req: Request<Incoming>,
) -> Response<ProxyBody> {
  let (scheme, hostname, port) = match parse_forward_target(req.uri()) {
    Some(target) => target,
    None => {
      return error_response(
        &ctx,
        &RequestError::BadRequest(format!(
          "proxy requests must use an absolute http:// or https:// URI, got {}",
          req.uri()
        )),
      )
    }
  };

  let auth_header = req
    .headers()
    .get(PROXY_AUTHORIZATION)
    .and_then(|v| v.to_str().ok());
  let policy_request =
    ctx.policy_request(req.method().as_str(), &hostname, port, false, auth_header);
  let decision = match ctx.evaluate_policy(&policy_request).await {
    Ok(decision) => decision,
    Err(err) => return error_response(&ctx, &err),
  };

  if decision.require_authentication {
    let realm = decision
      .realm
      .clone()
      .unwrap_or_else(|| ctx.core.options.auth_realm.clone());
    return error_response(&ctx, &RequestError::AuthRequired { realm });
  }

  if let Some(responder) = &decision.custom_response {
    let custom = responder.respond(&policy_request).await;
    let mut builder = Response::builder()
      .status(StatusCode::from_u16(custom.status).unwrap_or(StatusCode::OK));
    for (name, value) in &custom.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    return builder
      .body(full_body(custom.body))
      .unwrap_or_else(|_| error_response(&ctx, &RequestError::BadRequest("bad custom response".into())));
  }

  let upstream = match &decision.upstream_proxy_url {
    Some(raw) => match upstream::validate_upstream_url(raw) {
      Ok(parsed) => Some(parsed),
      Err(e) => {
        return error_response(&ctx, &RequestError::UpstreamMisconfigured(e.to_string()))
      }
    },
    None => None,
  };

  let dial_options = DialOptions {
    dns: decision.dns_lookup.clone(),
    local_address: decision.local_address,
    timeout: ctx.core.options.connect_timeout,
  };

  // `absolute_form` is set when the next hop is an HTTP upstream that must
  // see the full URI instead of the origin-form path.
  let (target_stream, absolute_form) = match dial_forward_target(
    &decision,
    upstream.as_ref(),
    &dial_options,
    scheme,
    &hostname,
    port,
  )
  .await
  {
    Ok(dialed) => dialed,
    Err(err) => return error_response(&ctx, &err),
  };

  let counted = crate::counting_stream::CountingStream::new(
    target_stream,
    ctx.counters.trg_rx.clone(),
    ctx.counters.trg_tx.clone(),
  );

  let io = TokioIo::new(counted);
  let (mut sender, conn) = match hyper::client::conn::http1::handshake::<_, Incoming>(io).await {
    Ok(pair) => pair,
    Err(e) => {
      let err = if upstream.is_some() {
        RequestError::UpstreamConnectFailed(hostname.clone(), e.to_string())
      } else {
        RequestError::TargetConnectFailed(
          hostname.clone(),
          std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e.to_string()),
        )
      };
      return error_response(&ctx, &err);
    }
  };
  let conn_id = ctx.id;
  tokio::spawn(async move {
    if let Err(e) = conn.await {
      log::debug!("connection {conn_id}: target connection ended: {e}");
    }
  });

  let outbound = build_outbound_request(req, &hostname, port, absolute_form, upstream.as_ref());

  match sender.send_request(outbound).await {
    // A 407 from the upstream means our chaining credentials were refused;
    // only CONNECT forwards the upstream's raw status to the client.
    Ok(response)
      if absolute_form && response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED =>
    {
      error_response(&ctx, &RequestError::AuthRejectedByUpstream)
    }
    Ok(response) => strip_response_hop_headers(response),
    Err(e) => {
      let err = if upstream.is_some() {
        RequestError::UpstreamConnectFailed(hostname.clone(), e.to_string())
      } else {
        RequestError::TargetConnectFailed(
          hostname,
          std::io::Error::new(std::io::ErrorKind::ConnectionReset, e.to_string()),
        )
      };
      error_response(&ctx, &err)
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardScheme {
  Http,
  Https,
}

fn parse_forward_target(uri: &Uri) -> Option<(ForwardScheme, String, u16)> {
  let scheme = match uri.scheme_str() {
    Some("http") => ForwardScheme::Http,
    Some("https") => ForwardScheme::Https,
    _ => return None,
  };
  let hostname = uri.host()?.to_string();
  let port = uri.port_u16().unwrap_or(match scheme {
    ForwardScheme::Http => 80,
    ForwardScheme::Https => 443,
  });
  Some((scheme, hostname, port))
}

/// Dial whatever the next hop is for a forwarded request: the origin
/// (directly or through an injected agent), or the upstream proxy (speaking
/// absolute-form for plain HTTP, or CONNECT + TLS for HTTPS origins).
async fn dial_forward_target(
  decision: &crate::policy::PolicyDecision,
  upstream: Option<&ProxyUrl>,
  dial_options: &DialOptions,
  scheme: ForwardScheme,
  hostname: &str,
  port: u16,
) -> Result<(BoxedStream, bool), RequestError> {
  match upstream {
    Some(upstream) => {
      let agent = if upstream.scheme.as_deref() == Some("https") {
        decision.https_agent.as_ref()
      } else {
        decision.http_agent.as_ref()
      };
      let mut stream = upstream::open_upstream_stream(
        upstream,
        agent,
        decision.ignore_upstream_proxy_certificate,
        dial_options,
      )
      .await?;

      match scheme {
        ForwardScheme::Http => Ok((stream, true)),
        ForwardScheme::Https => {
          // The upstream sees only a CONNECT; TLS to the origin runs inside
          // the tunnel with normal verification.
          let (reply, leftover) =
            upstream::connect_via_upstream(&mut stream, hostname, port, upstream).await?;
          if reply.status != 200 {
            return Err(RequestError::UpstreamBadStatus {
              status: reply.status,
              reason: reply.reason,
            });
          }
          let stream: BoxedStream = if leftover.is_empty() {
            stream
          } else {
            Box::new(crate::counting_stream::PrependReader::new(leftover, stream))
          };
          let tls = upstream::tls_connect(stream, hostname, false)
            .await
            .map_err(|e| RequestError::TargetConnectFailed(hostname.to_string(), e))?;
          Ok((tls, false))
        }
      }
    }
    None => {
      let agent = match scheme {
        ForwardScheme::Http => decision.http_agent.as_ref(),
        ForwardScheme::Https => decision.https_agent.as_ref(),
      };
      if let Some(agent) = agent {
        let stream = agent
          .dial(hostname, port)
          .await
          .map_err(|e| RequestError::TargetConnectFailed(hostname.to_string(), e))?;
        return Ok((stream, false));
      }
      let tcp = dial_tcp_for_target(hostname, port, dial_options).await?;
      match scheme {
        ForwardScheme::Http => Ok((Box::new(tcp), false)),
        ForwardScheme::Https => {
          let tls = upstream::tls_connect(Box::new(tcp), hostname, false)
            .await
            .map_err(|e| RequestError::TargetConnectFailed(hostname.to_string(), e))?;
          Ok((tls, false))
        }
      }
    }
  }
}

pub(crate) async fn dial_tcp_for_target(
  hostname: &str,
  port: u16,
  dial_options: &DialOptions,
) -> Result<tokio::net::TcpStream, RequestError> {
  upstream::dial_tcp(hostname, port, dial_options)
    .await
    .map_err(|e| match e {
      DialError::Dns => RequestError::TargetDnsFailed(hostname.to_string()),
      DialError::Timeout => RequestError::TargetTimeout(hostname.to_string()),
      DialError::Connect(err) => RequestError::TargetConnectFailed(hostname.to_string(), err),
    })
}

/// Rewrite the client's request for the next hop: strip hop-by-hop headers
/// (including any named by `Connection`), rewrite the target to origin-form
/// unless an HTTP upstream needs the absolute-form, keep the body streaming.
fn build_outbound_request(
  req: Request<Incoming>,
  hostname: &str,
  port: u16,
  absolute_form: bool,
  upstream: Option<&ProxyUrl>,
) -> Request<Incoming> {
  let connection_value = req
    .headers()
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);

  let (mut parts, body) = req.into_parts();

  if !absolute_form {
    let path = parts
      .uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| "/".to_string());
    parts.uri = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
  }
  parts.version = Version::HTTP_11;

  let to_remove: Vec<HeaderName> = parts
    .headers
    .keys()
    .filter(|name| {
      url_utils::is_hop_by_hop(name.as_str(), connection_value.as_deref())
        // Netscape-era alias still sent by real clients.
        || name.as_str().eq_ignore_ascii_case("proxy-connection")
    })
    .cloned()
    .collect();
  for name in to_remove {
    parts.headers.remove(&name);
  }

  if !parts.headers.contains_key(HOST) {
    let host_value = if port == 80 || port == 443 {
      hostname.to_string()
    } else {
      format!("{hostname}:{port}")
    };
    if let Ok(value) = HeaderValue::from_str(&host_value) {
      parts.headers.insert(HOST, value);
    }
  }

  // Credentials for the upstream hop, when forwarding in absolute-form.
  if absolute_form {
    if let Some(auth) = upstream.and_then(|u| u.basic_auth_header()) {
      if let Ok(value) = HeaderValue::from_str(&auth) {
        parts
          .headers
          .insert(hyper::header::PROXY_AUTHORIZATION, value);
      }
    }
  }

  Request::from_parts(parts, body)
}

/// Drop hop-by-hop headers from the target's response before relaying it.
fn strip_response_hop_headers(response: Response<Incoming>) -> Response<ProxyBody> {
  let connection_value = response
    .headers()
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);

  let (mut parts, body) = response.into_parts();
  let to_remove: Vec<HeaderName> = parts
    .headers
    .keys()
    .filter(|name| url_utils::is_hop_by_hop(name.as_str(), connection_value.as_deref()))
    .cloned()
    .collect();
  for name in to_remove {
    parts.headers.remove(&name);
  }

  Response::from_parts(parts, body.boxed())
}
