//! Listener supervisor and hot-swappable tenant routers.
//!
//! One supervisor pass runs at a time.  Each pass builds a fresh
//! handler+router per tenant, then reconciles against the live listener
//! set: same address swaps the router atomically and drains the old one
//! in the background, a changed address is rejected, a new tenant binds
//! a fresh loopback listener, and removed tenants have their servers
//! closed.  The listening sockets themselves are never rebound during a
//! swap, so in-flight requests keep their connection.
//!
//! Serving goes through hyper's auto protocol builder, so HTTP/1.1 and
//! h2c are both spoken on every listener.

use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use metrics::counter;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::handlers::ServiceHandler;
use crate::metrics::{RECONFIG_PASSES_TOTAL, ROUTER_SWAPS_TOTAL};
use crate::server::build_tenant;

/// Poll interval while waiting for a replaced router to drain.
const DRAIN_POLL: Duration = Duration::from_secs(1);

/// How long SIGTERM shutdown waits for in-flight requests per listener.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

// -- Counted router ----------------------------------------------------------

/// A router plus the number of requests currently inside it.
pub struct CountedRouter {
    router: Router,
    in_flight: AtomicI32,
}

impl CountedRouter {
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router,
            in_flight: AtomicI32::new(0),
        })
    }

    pub fn in_flight(&self) -> i32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count when dropped, so a request that is
/// cancelled mid-flight still releases its slot.
struct InFlightGuard(Arc<CountedRouter>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// -- Router swapper ----------------------------------------------------------

/// Indirection that lets a live server's router be replaced without
/// touching the listening socket.
///
/// Each request takes the lock just long enough to capture the current
/// inner router, then runs against that capture for its whole lifetime;
/// a concurrent swap only affects later requests.
#[derive(Clone)]
pub struct RouterSwapper {
    inner: Arc<Mutex<Arc<CountedRouter>>>,
}

impl RouterSwapper {
    pub fn new(router: Arc<CountedRouter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(router)),
        }
    }

    /// Capture the current inner router.
    pub fn current(&self) -> Arc<CountedRouter> {
        self.inner.lock().expect("router swapper lock poisoned").clone()
    }

    /// Swap in a new inner router, returning the replaced one.
    pub fn replace(&self, new: Arc<CountedRouter>) -> Arc<CountedRouter> {
        let mut guard = self.inner.lock().expect("router swapper lock poisoned");
        std::mem::replace(&mut *guard, new)
    }
}

impl tower::Service<Request> for RouterSwapper {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let counted = self.current();
        counted.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(counted.clone());
        let router = counted.router.clone();
        Box::pin(async move {
            let _guard = guard;
            router.oneshot(req).await
        })
    }
}

/// Wait until the old router has no requests inside, then shut its
/// handler down.
async fn drain_then_shutdown(old: Arc<CountedRouter>, handler: Option<Arc<dyn ServiceHandler>>) {
    loop {
        if old.in_flight() <= 0 {
            if let Some(handler) = handler {
                handler.shutdown().await;
            }
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

// -- Supervisor --------------------------------------------------------------

struct ListenerEntry {
    bound_addr: SocketAddr,
    swapper: RouterSwapper,
    handler: Option<Arc<dyn ServiceHandler>>,
    serve_task: JoinHandle<()>,
}

/// Owns the set of bound tenant listeners.
#[derive(Default)]
pub struct Supervisor {
    /// Serializes reconfiguration passes.
    pass_lock: tokio::sync::Mutex<()>,
    entries: Mutex<HashMap<String, ListenerEntry>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the listener set against `config`.  Called at startup
    /// and on every config change; per-tenant failures are logged and do
    /// not stop the pass.
    pub async fn apply(&self, config: &Config) {
        let _pass = self.pass_lock.lock().await;
        counter!(RECONFIG_PASSES_TOTAL).increment(1);

        for (key, tenant_config) in config.tenants() {
            let built = match build_tenant(key, tenant_config).await {
                Ok(built) => built,
                Err(e) => {
                    error!("tenant {key}: handler construction failed: {e:#}");
                    continue;
                }
            };
            if !built.should_listen {
                continue;
            }

            let addr: SocketAddr = ([127, 0, 0, 1], tenant_config.port).into();

            // Reconcile against any existing entry under the table lock;
            // binding happens outside it.
            enum Action {
                Swap(RouterSwapper, Option<Arc<dyn ServiceHandler>>),
                Bind,
                Skip,
            }
            let action = {
                let mut entries = self.entries.lock().expect("listener table lock poisoned");
                match entries.get_mut(key.as_str()) {
                    Some(entry) if entry.bound_addr != addr => {
                        error!(
                            "cannot change bind address for tenant {key} from {} to {addr}",
                            entry.bound_addr
                        );
                        Action::Skip
                    }
                    Some(entry) => {
                        let old_handler =
                            std::mem::replace(&mut entry.handler, built.handler.clone());
                        Action::Swap(entry.swapper.clone(), old_handler)
                    }
                    None => Action::Bind,
                }
            };

            match action {
                Action::Skip => {}
                Action::Swap(swapper, old_handler) => {
                    info!("tenant {key}: swapping router on {addr}");
                    counter!(ROUTER_SWAPS_TOTAL).increment(1);
                    let old = swapper.replace(CountedRouter::new(built.router));
                    tokio::spawn(drain_then_shutdown(old, old_handler));
                }
                Action::Bind => {
                    let listener = match tokio::net::TcpListener::bind(addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("tenant {key}: could not bind {addr}: {e}");
                            if config.panic_on_bind_error {
                                error!("panic_on_bind_error set, exiting");
                                std::process::exit(1);
                            }
                            continue;
                        }
                    };

                    let swapper = RouterSwapper::new(CountedRouter::new(built.router));
                    let serve_swapper = swapper.clone();
                    let task_key = key.clone();
                    let serve_task = tokio::spawn(async move {
                        use axum::ServiceExt;
                        let service = serve_swapper.into_make_service();
                        if let Err(e) = axum::serve(listener, service).await {
                            error!("tenant {task_key}: server error: {e}");
                        }
                    });

                    info!("tenant {key}: listening on {addr}");
                    let mut entries =
                        self.entries.lock().expect("listener table lock poisoned");
                    entries.insert(
                        key.clone(),
                        ListenerEntry {
                            bound_addr: addr,
                            swapper,
                            handler: built.handler,
                            serve_task,
                        },
                    );
                }
            }
        }

        // Tenants that disappeared from the config lose their listeners;
        // whatever is in flight there surfaces as a connection reset.
        let removed: Vec<(String, ListenerEntry)> = {
            let mut entries = self.entries.lock().expect("listener table lock poisoned");
            let stale: Vec<String> = entries
                .keys()
                .filter(|key| config.tenant(key).is_none())
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        for (key, entry) in removed {
            info!("removing tenant {key} on {}", entry.bound_addr);
            entry.serve_task.abort();
            if let Some(handler) = entry.handler {
                tokio::spawn(async move { handler.shutdown().await });
            }
        }
    }

    /// The address a tenant is currently bound to, if any.
    pub fn bound_addr(&self, key: &str) -> Option<SocketAddr> {
        let entries = self.entries.lock().expect("listener table lock poisoned");
        entries.get(key).map(|entry| entry.bound_addr)
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let entries = self.entries.lock().expect("listener table lock poisoned");
        entries.len()
    }

    /// Push refreshed tenant configs into live handlers ahead of a pass,
    /// so surviving handlers see the new document even before their
    /// routers are swapped.
    pub fn push_configs(&self, config: &Config) {
        let entries = self.entries.lock().expect("listener table lock poisoned");
        for (key, entry) in entries.iter() {
            if let (Some(handler), Some(tenant)) = (&entry.handler, config.tenant(key)) {
                handler.set_config(tenant.clone());
            }
        }
    }

    /// Drain and close every listener.  Used on SIGTERM.
    pub async fn close_all(&self) {
        let _pass = self.pass_lock.lock().await;
        let entries: Vec<(String, ListenerEntry)> = {
            let mut entries = self.entries.lock().expect("listener table lock poisoned");
            entries.drain().collect()
        };
        for (key, entry) in entries {
            debug!("closing tenant {key} on {}", entry.bound_addr);
            let counted = entry.swapper.current();
            let deadline = std::time::Instant::now() + SHUTDOWN_DRAIN;
            while counted.in_flight() > 0 && std::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            entry.serve_task.abort();
            if let Some(handler) = entry.handler {
                handler.shutdown().await;
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn labelled_router(label: &'static str) -> Router {
        Router::new().route("/", get(move || async move { label }))
    }

    async fn call(swapper: &RouterSwapper) -> String {
        let response = swapper
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_swap_routes_new_requests_to_new_router() {
        let swapper = RouterSwapper::new(CountedRouter::new(labelled_router("old")));
        assert_eq!(call(&swapper).await, "old");

        let old = swapper.replace(CountedRouter::new(labelled_router("new")));
        assert_eq!(call(&swapper).await, "new");
        assert_eq!(old.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_captured_before_swap_finishes_on_old_router() {
        // The handler blocks until released, holding its capture of the
        // old router across the swap.
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let blocking = Router::new().route(
            "/",
            get(move || {
                let mut gate = release_rx.clone();
                async move {
                    while !*gate.borrow_and_update() {
                        if gate.changed().await.is_err() {
                            break;
                        }
                    }
                    "old"
                }
            }),
        );

        let swapper = RouterSwapper::new(CountedRouter::new(blocking));
        let old = swapper.current();

        let in_flight_swapper = swapper.clone();
        let request = tokio::spawn(async move { call(&in_flight_swapper).await });

        // Wait for the request to enter the old router.
        while old.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let replaced = swapper.replace(CountedRouter::new(labelled_router("new")));
        assert_eq!(replaced.in_flight(), 1);

        release_tx.send(true).unwrap();
        assert_eq!(request.await.unwrap(), "old");
        assert_eq!(replaced.in_flight(), 0);

        // New requests land on the new router.
        assert_eq!(call(&swapper).await, "new");
    }

    #[tokio::test]
    async fn test_in_flight_guard_releases_on_cancel() {
        let pending =
            Router::new().route("/", get(|| async { std::future::pending::<String>().await }));
        let swapper = RouterSwapper::new(CountedRouter::new(pending));
        let counted = swapper.current();

        let cancelled_swapper = swapper.clone();
        let task = tokio::spawn(async move { call(&cancelled_swapper).await });
        while counted.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(counted.in_flight(), 0);
    }

    fn test_config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_apply_binds_and_reload_adds_listener() {
        let supervisor = Supervisor::new();
        supervisor
            .apply(&test_config(
                r#"
aws_configs:
  k1:
    port: 39251
    service_type: s3
    dest_gcp:
      from_instance_metadata: true
      project: demo
"#,
            ))
            .await;
        assert_eq!(supervisor.listener_count(), 1);
        assert_eq!(
            supervisor.bound_addr("k1").unwrap().to_string(),
            "127.0.0.1:39251"
        );

        // Unroutable method hits the catch-all without any upstream.
        let status = reqwest::Client::new()
            .patch("http://127.0.0.1:39251/")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        // Reload: k1 unchanged, k2 added.
        supervisor
            .apply(&test_config(
                r#"
aws_configs:
  k1:
    port: 39251
    service_type: s3
    dest_gcp:
      from_instance_metadata: true
      project: demo
  k2:
    port: 39252
    service_type: sqs
    dest_gcp:
      from_instance_metadata: true
      project: demo
"#,
            ))
            .await;
        assert_eq!(supervisor.listener_count(), 2);

        // k1 still answers after the swap...
        let status = reqwest::Client::new()
            .patch("http://127.0.0.1:39251/")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        // ...and k2 accepts connections.
        let status = reqwest::Client::new()
            .patch("http://127.0.0.1:39252/")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        supervisor.close_all().await;
    }

    #[tokio::test]
    async fn test_rebind_rejected_keeps_old_listener() {
        let supervisor = Supervisor::new();
        supervisor
            .apply(&test_config(
                r#"
aws_configs:
  k1:
    port: 39261
    service_type: s3
    dest_gcp:
      from_instance_metadata: true
      project: demo
"#,
            ))
            .await;

        // A pass that tries to move k1 to another port is rejected.
        supervisor
            .apply(&test_config(
                r#"
aws_configs:
  k1:
    port: 39262
    service_type: s3
    dest_gcp:
      from_instance_metadata: true
      project: demo
"#,
            ))
            .await;

        assert_eq!(
            supervisor.bound_addr("k1").unwrap().to_string(),
            "127.0.0.1:39261"
        );
        let status = reqwest::Client::new()
            .patch("http://127.0.0.1:39261/")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        supervisor.close_all().await;
    }

    #[tokio::test]
    async fn test_removed_tenant_stops_listening() {
        let supervisor = Supervisor::new();
        supervisor
            .apply(&test_config(
                r#"
aws_configs:
  k1:
    port: 39271
    service_type: s3
    dest_gcp:
      from_instance_metadata: true
      project: demo
"#,
            ))
            .await;
        assert_eq!(supervisor.listener_count(), 1);

        supervisor.apply(&test_config("aws_configs: {}")).await;
        assert_eq!(supervisor.listener_count(), 0);

        // Give the aborted serve task a beat to release the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reqwest::Client::new()
            .patch("http://127.0.0.1:39271/")
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .is_err());
    }
}
