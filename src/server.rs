use crate::counting_stream::{CountingStream, PrependReader};
use crate::error::{ProxyError, RequestError};
use crate::events::{EventBus, ServerEvent};
use crate::forward::{self, ProxyBody};
use crate::policy::{AsyncStream, PolicyDecision, PolicyRequest, RequestPolicy};
use crate::registry::{ConnectionCounters, ConnectionRegistry, ConnectionStats};
use crate::tls::TlsIdentity;
use crate::tunnel;
use crate::upstream::{find_head_end, ConnectObserver, ConnectReplyInfo};
use crate::url_utils::parse_proxy_auth;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// Plain-TCP or TLS listener.
#[derive(Clone)]
pub enum ServerKind {
  Http,
  Https(TlsIdentity),
}

impl Default for ServerKind {
  fn default() -> Self {
    ServerKind::Http
  }
}

#[derive(Clone)]
pub struct ServerOptions {
  pub bind_addr: SocketAddr,
  pub kind: ServerKind,
  /// Realm for `Proxy-Authenticate` challenges when the policy does not
  /// supply one.
  pub auth_realm: String,
  /// Per-request inspection hook. Absent means "forward everything
  /// directly".
  pub policy: Option<Arc<dyn RequestPolicy>>,
  /// Applied to every outbound dial (origin and upstream).
  pub connect_timeout: Duration,
  /// How long a graceful close waits before destroying stragglers.
  pub graceful_close_timeout: Duration,
}

impl Default for ServerOptions {
  fn default() -> Self {
    Self {
      bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
      kind: ServerKind::Http,
      auth_realm: "proxy-bridge".to_string(),
      policy: None,
      connect_timeout: Duration::from_secs(30),
      graceful_close_timeout: Duration::from_secs(30),
    }
  }
}

/// State shared by the listener task and every connection task.
pub(crate) struct ServerCore {
  pub options: ServerOptions,
  pub registry: ConnectionRegistry,
  pub events: EventBus,
  pub connect_observer: Mutex<Option<ConnectObserver>>,
}

/// Per-connection context handed to the forward and tunnel handlers.
pub(crate) struct ConnContext {
  pub id: u64,
  pub peer_addr: SocketAddr,
  pub counters: Arc<ConnectionCounters>,
  /// Cancelled to force-destroy this connection.
  pub abort: CancellationToken,
  pub core: Arc<ServerCore>,
  /// Relay task spawned by the hyper-upgrade CONNECT path; awaited before
  /// the connection counts as closed.
  tunnel_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnContext {
  pub(crate) fn policy_request(
    &self,
    method: &str,
    hostname: &str,
    port: u16,
    is_tunnel: bool,
    auth_header: Option<&str>,
  ) -> PolicyRequest {
    let auth = auth_header.and_then(parse_proxy_auth);
    PolicyRequest {
      connection_id: self.id,
      peer_addr: self.peer_addr,
      method: method.to_string(),
      target_hostname: hostname.to_string(),
      target_port: port,
      is_tunnel,
      username: auth.as_ref().map(|a| a.username.clone()),
      password: auth.and_then(|a| a.password),
    }
  }

  pub(crate) async fn evaluate_policy(
    &self,
    request: &PolicyRequest,
  ) -> Result<PolicyDecision, RequestError> {
    match &self.core.options.policy {
      Some(policy) => policy
        .evaluate(request)
        .await
        .map_err(|e| RequestError::PolicyHookFailed(e.to_string())),
      None => Ok(PolicyDecision::default()),
    }
  }

  pub(crate) fn report_failure(&self, err: &RequestError) {
    log::debug!("connection {}: request failed: {err}", self.id);
    self.core.events.emit(ServerEvent::RequestFailed {
      id: self.id,
      error: err.to_string(),
    });
  }

  pub(crate) fn notify_connect_observer(&self, reply: &ConnectReplyInfo) {
    let observer = self.core.connect_observer.lock().unwrap().clone();
    if let Some(observer) = observer {
      observer(reply);
    }
  }

  pub(crate) fn set_tunnel_task(&self, task: JoinHandle<()>) {
    *self.tunnel_task.lock().unwrap() = Some(task);
  }

  fn take_tunnel_task(&self) -> Option<JoinHandle<()>> {
    self.tunnel_task.lock().unwrap().take()
  }
}

struct ListenerState {
  local_addr: Option<SocketAddr>,
  accept_cancel: CancellationToken,
  graceful: CancellationToken,
  tracker: TaskTracker,
  accept_task: Option<JoinHandle<()>>,
}

/// The proxy server: a listener plus the per-connection machinery.
///
/// ```ignore
/// let server = ProxyServer::new(ServerOptions::default());
/// let addr = server.listen().await?;
/// // ...
/// server.close(false).await;
/// ```
pub struct ProxyServer {
  core: Arc<ServerCore>,
  state: Mutex<ListenerState>,
}

impl ProxyServer {
  pub fn new(options: ServerOptions) -> Self {
    Self {
      core: Arc::new(ServerCore {
        options,
        registry: ConnectionRegistry::new(),
        events: EventBus::default(),
        connect_observer: Mutex::new(None),
      }),
      state: Mutex::new(ListenerState {
        local_addr: None,
        accept_cancel: CancellationToken::new(),
        graceful: CancellationToken::new(),
        tracker: TaskTracker::new(),
        accept_task: None,
      }),
    }
  }

  /// Bind and start accepting. Returns the bound address (useful with port
  /// zero).
  pub async fn listen(&self) -> Result<SocketAddr, ProxyError> {
    let bind_addr = self.core.options.bind_addr;
    if self.local_addr().is_some() {
      return Err(ProxyError::ListenFailed {
        addr: bind_addr.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "already listening"),
      });
    }

    let tls_acceptor = match &self.core.options.kind {
      ServerKind::Http => None,
      ServerKind::Https(identity) => {
        let config = identity.server_config()?;
        Some(TlsAcceptor::from(Arc::new(config)))
      }
    };

    let listener = TcpListener::bind(bind_addr)
      .await
      .map_err(|source| ProxyError::ListenFailed {
        addr: bind_addr.to_string(),
        source,
      })?;
    let local_addr = listener.local_addr().map_err(|source| ProxyError::ListenFailed {
      addr: bind_addr.to_string(),
      source,
    })?;

    let (accept_cancel, graceful, tracker) = {
      let mut state = self.state.lock().unwrap();
      state.local_addr = Some(local_addr);
      (
        state.accept_cancel.clone(),
        state.graceful.clone(),
        state.tracker.clone(),
      )
    };

    log::info!("proxy listening on {local_addr}");

    let core = self.core.clone();
    let accept_task = tokio::spawn(accept_loop(
      core,
      listener,
      tls_acceptor,
      accept_cancel,
      graceful,
      tracker,
    ));
    self.state.lock().unwrap().accept_task = Some(accept_task);

    Ok(local_addr)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.state.lock().unwrap().local_addr
  }

  pub fn port(&self) -> Option<u16> {
    self.local_addr().map(|addr| addr.port())
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.core.events.subscribe()
  }

  /// IDs of connections that are not yet closed.
  pub fn connection_ids(&self) -> Vec<u64> {
    self.core.registry.connection_ids()
  }

  /// Live byte counters for one connection, or None once it has closed.
  pub fn connection_stats(&self, id: u64) -> Option<ConnectionStats> {
    self.core.registry.stats(id)
  }

  /// Force-destroy a single connection. Returns false for unknown IDs.
  pub fn close_connection(&self, id: u64) -> bool {
    self.core.registry.abort(id)
  }

  /// Attach the observer that receives upstream CONNECT replies.
  pub fn set_connect_observer(&self, observer: ConnectObserver) {
    *self.core.connect_observer.lock().unwrap() = Some(observer);
  }

  /// Stop the listener and shut down. A graceful close waits for live
  /// connections (bounded by `graceful_close_timeout`); a forced close
  /// destroys them immediately.
  pub async fn close(&self, force: bool) {
    let (accept_cancel, graceful, tracker, accept_task) = {
      let mut state = self.state.lock().unwrap();
      (
        state.accept_cancel.clone(),
        state.graceful.clone(),
        state.tracker.clone(),
        state.accept_task.take(),
      )
    };

    accept_cancel.cancel();
    if let Some(task) = accept_task {
      let _ = task.await;
    }
    tracker.close();

    if force {
      self.core.registry.abort_all();
    } else {
      graceful.cancel();
      let timeout = self.core.options.graceful_close_timeout;
      if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
        log::warn!("graceful close timed out, destroying remaining connections");
        self.core.registry.abort_all();
      }
    }
    tracker.wait().await;
    log::info!("proxy closed");
  }
}

async fn accept_loop(
  core: Arc<ServerCore>,
  listener: TcpListener,
  tls_acceptor: Option<TlsAcceptor>,
  accept_cancel: CancellationToken,
  graceful: CancellationToken,
  tracker: TaskTracker,
) {
  loop {
    tokio::select! {
      _ = accept_cancel.cancelled() => break,
      result = listener.accept() => match result {
        Ok((stream, peer_addr)) => {
          let _ = stream.set_nodelay(true);
          tracker.spawn(handle_accepted(
            core.clone(),
            tls_acceptor.clone(),
            stream,
            peer_addr,
            graceful.clone(),
          ));
        }
        Err(e) => {
          log::warn!("accept error: {e}");
          tokio::time::sleep(Duration::from_millis(100)).await;
        }
      }
    }
  }
  // Listener drops here, releasing the port before connections drain.
}

async fn handle_accepted(
  core: Arc<ServerCore>,
  tls_acceptor: Option<TlsAcceptor>,
  stream: TcpStream,
  peer_addr: SocketAddr,
  graceful: CancellationToken,
) {
  match tls_acceptor {
    Some(acceptor) => {
      // Handshake failures never become Connection entries.
      match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => serve_client(core, tls_stream, peer_addr, graceful).await,
        Ok(Err(e)) => {
          log::debug!("TLS handshake with {peer_addr} failed: {e}");
          core.events.emit(ServerEvent::TlsError {
            error: e.to_string(),
          });
        }
        Err(_) => {
          core.events.emit(ServerEvent::TlsError {
            error: format!("TLS handshake with {peer_addr} timed out"),
          });
        }
      }
    }
    None => serve_client(core, stream, peer_addr, graceful).await,
  }
}

async fn serve_client<S>(
  core: Arc<ServerCore>,
  stream: S,
  peer_addr: SocketAddr,
  graceful: CancellationToken,
) where
  S: AsyncStream + 'static,
{
  let handle = core.registry.register();
  core.events.emit(ServerEvent::Connection { id: handle.id });

  let ctx = Arc::new(ConnContext {
    id: handle.id,
    peer_addr,
    counters: handle.counters.clone(),
    abort: handle.abort.clone(),
    core: core.clone(),
    tunnel_task: Mutex::new(None),
  });

  let counted = CountingStream::new(
    stream,
    ctx.counters.src_rx.clone(),
    ctx.counters.src_tx.clone(),
  );

  tokio::select! {
    _ = drive_client(ctx.clone(), counted, graceful) => {}
    _ = ctx.abort.cancelled() => {
      log::debug!("connection {} force-closed", ctx.id);
    }
  }

  if let Some(task) = ctx.take_tunnel_task() {
    let _ = task.await;
  }

  if let Some(stats) = core.registry.unregister(ctx.id) {
    core.events.emit(ServerEvent::ConnectionClosed {
      id: ctx.id,
      stats,
    });
  }
}

/// Sniff the first bytes of the connection: a leading CONNECT takes the raw
/// tunnel fast path, everything else replays into the HTTP/1.1 parser.
async fn drive_client<S>(
  ctx: Arc<ConnContext>,
  mut counted: CountingStream<S>,
  graceful: CancellationToken,
) where
  S: AsyncStream + 'static,
{
  let mut sniff: Vec<u8> = Vec::with_capacity(1024);
  let mut chunk = [0u8; 1024];

  let is_connect = loop {
    if sniff.len() >= 8 {
      break sniff[..7].eq_ignore_ascii_case(b"CONNECT") && sniff[7] == b' ';
    }
    match counted.read(&mut chunk).await {
      Ok(0) => {
        if sniff.is_empty() {
          return;
        }
        break false;
      }
      Ok(n) => sniff.extend_from_slice(&chunk[..n]),
      Err(e) => {
        log::debug!("connection {}: read error: {e}", ctx.id);
        return;
      }
    }
  };

  if is_connect {
    let head_end = loop {
      if let Some(pos) = find_head_end(&sniff) {
        break pos;
      }
      if sniff.len() > MAX_REQUEST_HEAD {
        ctx.report_failure(&RequestError::BadRequest("oversized request head".to_string()));
        return;
      }
      match counted.read(&mut chunk).await {
        Ok(0) => return,
        Ok(n) => sniff.extend_from_slice(&chunk[..n]),
        Err(e) => {
          log::debug!("connection {}: read error: {e}", ctx.id);
          return;
        }
      }
    };
    let leftover = sniff.split_off(head_end);
    tunnel::handle_connect_raw(ctx, counted, sniff, leftover).await;
    return;
  }

  let io = TokioIo::new(PrependReader::new(sniff, counted));
  let service_ctx = ctx.clone();
  let service = service_fn(move |req: Request<Incoming>| {
    let ctx = service_ctx.clone();
    async move { Ok::<Response<ProxyBody>, Infallible>(dispatch(ctx, req).await) }
  });

  let mut conn = pin!(http1::Builder::new()
    .preserve_header_case(true)
    .title_case_headers(true)
    .serve_connection(io, service)
    .with_upgrades());

  let mut draining = false;
  loop {
    tokio::select! {
      result = conn.as_mut() => {
        if let Err(e) = result {
          ctx.report_failure(&RequestError::ClientGone(e.to_string()));
        }
        break;
      }
      _ = graceful.cancelled(), if !draining => {
        conn.as_mut().graceful_shutdown();
        draining = true;
      }
    }
  }
}

async fn dispatch(ctx: Arc<ConnContext>, req: Request<Incoming>) -> Response<ProxyBody> {
  if req.method() == Method::CONNECT {
    tunnel::handle_connect_upgrade(ctx, req).await
  } else {
    forward::handle_forward(ctx, req).await
  }
}
