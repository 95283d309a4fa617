//! The engine: binds everything from the config at startup, serves HTTP and runs the background loops.

use crate::config::Config;
use crate::cron::{group_jobs, spawn_groups, CronGroup};
use crate::error::{EmulatorError, EmulatorResult};
use crate::event::Identity;
use crate::handlers::{self, lambda_proxy::ProxyContext, ResponseBody};
use crate::lambda::Resolver;
use crate::mocks::{MockConfig, MockRegistry};
use crate::router::{bind_routes, find_route, RouteBinding};
use crate::shutdown::Shutdown;
use crate::stream::{spawn_pollers, StreamBinding, StreamSource};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// The header AWS SDKs use to name the operation in the JSON protocol.
const AMZ_TARGET: &str = "x-amz-target";
/// Pause after a failed accept, e.g. when the process is out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// All bindings resolved from the config. Immutable once built.
pub struct Engine {
    routes: Vec<RouteBinding>,
    streams: Vec<StreamBinding>,
    cron: Vec<CronGroup>,
    identity: Identity,
    mocks: Arc<MockRegistry>,
    timeout: Option<Duration>,
}

impl Engine {
    /// Resolves all handlers named in the config.
    /// Bindings that fail to resolve are logged and left out, the rest of the config is still served.
    pub fn new(config: &Config, resolver: &dyn Resolver) -> Self {
        let routes = bind_routes(&config.routes, resolver);

        let streams = config
            .streams
            .iter()
            .filter_map(|stream| StreamBinding::resolve(stream, resolver))
            .collect();

        let cron = group_jobs(&config.cron, resolver);

        Self {
            routes,
            streams,
            cron,
            identity: config.identity(),
            mocks: Arc::new(MockRegistry::new(Arc::new(MockConfig::from(config)))),
            timeout: config.handler_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn routes(&self) -> &[RouteBinding] {
        &self.routes
    }

    pub fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Starts the stream pollers and the cron loops. Either is started only if it has bindings.
    /// The stream source is only needed if there are stream bindings.
    pub fn start_background(&self, source: Option<Arc<dyn StreamSource>>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if !self.streams.is_empty() {
            match source {
                Some(source) => tasks.extend(spawn_pollers(self.streams.clone(), source, self.timeout, shutdown)),
                None => warn!("No stream source: {} stream binding(s) not started", self.streams.len()),
            }
        }

        if !self.cron.is_empty() {
            tasks.extend(spawn_groups(self.cron.clone(), self.timeout, shutdown));
        }

        tasks
    }

    /// Dispatches a single HTTP request in this order: CORS preflight, mocked AWS service,
    /// configured routes, landing page.
    pub async fn handle(&self, req: Request<Incoming>, remote: Option<SocketAddr>) -> Response<ResponseBody> {
        debug!("{} {}", req.method(), req.uri());

        if req.method() == Method::OPTIONS {
            return handlers::preflight::handler(req.uri().path());
        }

        let route = find_route(&self.routes, req.method(), req.uri().path());

        if req.method() == Method::POST {
            let target = req
                .headers()
                .get(AMZ_TARGET)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string());

            if let Some(target) = target {
                // a route can still accept X-Amz-Target if it is not one of the mocked services
                if self.mocks.resolve_target(&target).is_some() || route.is_none() {
                    return handlers::mock_service::handler(req, &target, &self.mocks).await;
                }
            }
        }

        if let Some((route, path_params)) = route {
            let ctx = ProxyContext {
                identity: &self.identity,
                mocks: Arc::clone(&self.mocks),
                timeout: self.timeout,
                remote,
            };
            return handlers::lambda_proxy::handler(req, route, path_params, ctx).await;
        }

        handlers::landing::handler(req.method(), req.uri().path())
    }

    /// Accepts connections until the shutdown flag is set, then lets the open connections
    /// finish their in-flight requests before returning.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: Shutdown) {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening on http://{addr}");
        }

        let mut connections = JoinSet::new();

        while !shutdown.is_stopped() {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.wait() => break,
            };

            let (stream, remote) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("Failed to accept a connection: {e}");
                    shutdown.sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            // forget finished connections
            while connections.try_join_next().is_some() {}

            let io = TokioIo::new(stream);
            let engine = Arc::clone(&self);
            let mut conn_shutdown = shutdown.clone();

            // Spawn a tokio task to serve multiple connections concurrently
            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let engine = Arc::clone(&engine);
                    async move { Ok::<_, hyper::Error>(engine.handle(req, Some(remote)).await) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);

                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = conn_shutdown.wait() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };

                if let Err(e) = res {
                    debug!("Connection from {remote} closed: {:?}", e);
                }
            });
        }

        debug!("Waiting for {} open connection(s)", connections.len());
        while connections.join_next().await.is_some() {}
        info!("HTTP server stopped");
    }
}

/// Binds the TCP listener. Failing to bind is fatal for the dev server.
pub async fn bind(addr: SocketAddr) -> EmulatorResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| EmulatorError::Startup(format!("cannot listen on {addr}: {e}")))
}
