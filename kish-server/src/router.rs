//! Host-based request routing.
//!
//! The live table is immutable. Registering or removing a host rebuilds a
//! whole new table from the registration set and swaps it in, so a request
//! that picked up a table keeps a consistent view for as long as it runs.

use axum::body::{Body, HttpBody};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{BoxError, Router};
use bytes::Bytes;
use kish_core::RoutingError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use tracing::{debug, info};

/// Produces the router serving one host.
pub type BuildFn = Arc<dyn Fn() -> Router + Send + Sync>;

/// One immutable generation of the routing table.
pub struct RouteTable {
    generation: u64,
    routes: HashMap<String, Router>,
}

impl RouteTable {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, host: &str) -> Option<&Router> {
        self.routes.get(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

struct Inner {
    registrations: BTreeMap<String, BuildFn>,
    generation: u64,
    current: Arc<RouteTable>,
}

/// Hostname to router dispatch with copy-on-write updates.
pub struct HostRouter {
    inner: Mutex<Inner>,
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase a host and strip any port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    bare.trim_end_matches('.').to_ascii_lowercase()
}

impl HostRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                registrations: BTreeMap::new(),
                generation: 0,
                current: Arc::new(RouteTable {
                    generation: 0,
                    routes: HashMap::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_registered(&self, host: &str) -> bool {
        self.lock().registrations.contains_key(&normalize_host(host))
    }

    /// Register a host. Fails if the host is already taken.
    pub fn register(&self, host: &str, build: BuildFn) -> Result<(), RoutingError> {
        let host = normalize_host(host);
        let (generation, snapshot) = {
            let mut inner = self.lock();
            if inner.registrations.contains_key(&host) {
                return Err(RoutingError::HostOccupied(host));
            }
            inner.registrations.insert(host.clone(), build);
            inner.generation += 1;
            (inner.generation, inner.registrations.clone())
        };
        info!("Registered host {}", host);
        self.install(generation, snapshot);
        Ok(())
    }

    /// Remove a host. Unknown hosts are ignored.
    pub fn unregister(&self, host: &str) {
        let host = normalize_host(host);
        let (generation, snapshot) = {
            let mut inner = self.lock();
            if inner.registrations.remove(&host).is_none() {
                return;
            }
            inner.generation += 1;
            (inner.generation, inner.registrations.clone())
        };
        info!("Unregistered host {}", host);
        self.install(generation, snapshot);
    }

    /// Build a table from a snapshot and swap it in unless a newer one won.
    fn install(&self, generation: u64, snapshot: BTreeMap<String, BuildFn>) {
        let routes = snapshot
            .iter()
            .map(|(host, build)| (host.clone(), build()))
            .collect();
        let table = Arc::new(RouteTable { generation, routes });

        let mut inner = self.lock();
        if inner.current.generation < generation {
            debug!(
                "Swapping route table {} -> {}",
                inner.current.generation, generation
            );
            inner.current = table;
        }
    }

    /// The table currently in use.
    pub fn table(&self) -> Arc<RouteTable> {
        self.lock().current.clone()
    }

    /// Route a request by its `Host` header.
    pub async fn dispatch<B>(&self, req: Request<B>) -> Response
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())
            .map(normalize_host)
            .unwrap_or_default();

        let router = self.table().get(&host).cloned();
        match router {
            Some(router) => router.oneshot(req.map(Body::new)).await.into_response(),
            None => {
                debug!("No route for host {:?}", host);
                (StatusCode::NOT_FOUND, "404 page not found").into_response()
            }
        }
    }
}
