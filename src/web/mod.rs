//! Request pipeline primitives.
//!
//! A route handler is a [`HandlerFunc`]. Cross-cutting behavior is a
//! [`MidFunc`] that takes the next handler and returns a new one. [`App`]
//! composes application-wide and per-route middleware around each handler
//! when the route is registered and mounts the result on an axum `Router`.
//!
//! Per-request state travels in a [`RequestScope`] value that is created at
//! the outermost boundary and moved down the chain.

/// Standard middleware.
pub mod mid;

use crate::db::CommitRollbacker;
use crate::types::{AppError, Claims, Result};
use axum::extract::{FromRequestParts, Path, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Header carrying a trace id across service boundaries.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Largest request body the pipeline will decode.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A request handler inside the pipeline.
pub type HandlerFunc =
    Arc<dyn Fn(RequestScope, Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// A middleware: wraps a handler in another handler.
pub type MidFunc = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Adapts an async function into a [`HandlerFunc`].
pub fn handler<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(RequestScope, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |scope, req| Box::pin(f(scope, req)))
}

/// Adapts a handler-transforming function into a [`MidFunc`].
pub fn middleware<F>(f: F) -> MidFunc
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps `handler` so that `mw[0]` runs first and `mw[last]` runs closest to
/// the handler.
pub fn wrap_middleware(mw: &[MidFunc], handler: HandlerFunc) -> HandlerFunc {
    mw.iter().rev().fold(handler, |h, m| m(h))
}

// ============= Request Scope =============

/// Values that live for one request.
#[derive(Clone)]
pub struct RequestScope {
    trace_id: Uuid,
    now: DateTime<Utc>,
    started: Instant,
    user_id: Option<Uuid>,
    claims: Option<Claims>,
    tx: Option<Arc<dyn CommitRollbacker>>,
}

impl RequestScope {
    /// A fresh scope with a new trace id.
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4())
    }

    /// Creates a scope that continues a trace started by another service.
    pub fn with_trace_id(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            now: Utc::now(),
            started: Instant::now(),
            user_id: None,
            claims: None,
            tx: None,
        }
    }

    /// Trace id of the request.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Wall-clock time the request was received.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Monotonic start of the request, for measuring duration.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// The authenticated identity, `Unauthenticated` when absent.
    pub fn user_id(&self) -> Result<Uuid> {
        self.user_id
            .ok_or_else(|| AppError::Unauthenticated("user id missing from request".to_string()))
    }

    /// The authenticated claims, `Unauthenticated` when absent.
    pub fn claims(&self) -> Result<&Claims> {
        self.claims
            .as_ref()
            .ok_or_else(|| AppError::Unauthenticated("claims missing from request".to_string()))
    }

    /// The transaction opened for this request, `Internal` when none was.
    pub fn transaction(&self) -> Result<&Arc<dyn CommitRollbacker>> {
        self.tx
            .as_ref()
            .ok_or_else(|| AppError::Internal("no transaction bound to request".to_string()))
    }

    /// Records the authenticated caller.
    pub fn set_identity(&mut self, user_id: Uuid, claims: Claims) {
        self.user_id = Some(user_id);
        self.claims = Some(claims);
    }

    /// Attaches the request transaction.
    pub fn set_transaction(&mut self, tx: Arc<dyn CommitRollbacker>) {
        self.tx = Some(tx);
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

// ============= App =============

/// Route table with an application-wide middleware chain.
pub struct App {
    router: Router,
    mw: Vec<MidFunc>,
}

impl App {
    /// Creates an app whose routes are all wrapped by `mw`, first outermost.
    pub fn new(mw: Vec<MidFunc>) -> Self {
        Self {
            router: Router::new(),
            mw,
        }
    }

    /// Registers `handler` for `method` at `/{version}{path}`.
    ///
    /// `route_mw` wraps the handler first, then the application middleware
    /// wraps the result, so the application chain is always outermost.
    pub fn handle(
        &mut self,
        method: MethodFilter,
        version: &str,
        path: &str,
        handler: HandlerFunc,
        route_mw: Vec<MidFunc>,
    ) {
        let h = wrap_middleware(&route_mw, handler);
        let h = wrap_middleware(&self.mw, h);
        self.mount(method, version, path, h);
    }

    /// Registers `handler` with no middleware at all, for probes.
    pub fn handle_no_mid(&mut self, method: MethodFilter, version: &str, path: &str, handler: HandlerFunc) {
        self.mount(method, version, path, handler);
    }

    fn mount(&mut self, method: MethodFilter, version: &str, path: &str, h: HandlerFunc) {
        let full_path = if version.is_empty() {
            path.to_string()
        } else {
            format!("/{}{}", version, path)
        };

        let router = std::mem::take(&mut self.router);
        self.router = router.route(
            &full_path,
            on(method, move |req: Request| {
                let h = h.clone();
                async move {
                    let scope = match incoming_trace_id(&req) {
                        Some(trace_id) => RequestScope::with_trace_id(trace_id),
                        None => RequestScope::new(),
                    };
                    match h(scope, req).await {
                        Ok(resp) => resp,
                        Err(err) => err.into_response(),
                    }
                }
            }),
        );
    }

    /// Finishes the app as an axum router.
    pub fn into_router(self) -> Router {
        self.router
    }
}

fn incoming_trace_id(req: &Request) -> Option<Uuid> {
    req.headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
}

// ============= Request Helpers =============

/// Reads the named path parameter, handing the request back unchanged.
pub async fn path_param(req: Request, name: &str) -> (Request, Option<String>) {
    let (mut parts, body) = req.into_parts();
    let value = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
        .await
        .ok()
        .and_then(|Path(mut params)| params.remove(name));

    (Request::from_parts(parts, body), value)
}

/// Decodes a JSON request body. A malformed body is `InvalidArgument`.
pub async fn decode<T: DeserializeOwned>(req: Request) -> Result<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError::InvalidArgument(format!("reading body: {}", e)))?;

    serde_json::from_slice(&bytes).map_err(|e| AppError::InvalidArgument(format!("decode: {}", e)))
}
