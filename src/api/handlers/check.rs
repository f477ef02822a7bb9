use crate::db::Beginner;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::types::AppError;
use crate::users::cache::{CacheStats, ShardedCache};
use crate::users::User;
use crate::web::{handler, HandlerFunc};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Bound on the readiness database probe.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    /// Always `up`.
    pub status: String,
    /// Build tag of the running binary.
    pub build: String,
    /// Host name.
    pub host: String,
    /// Pod name, from `KUBERNETES_NAME`.
    pub name: String,
    /// Pod address, from `KUBERNETES_POD_IP`.
    pub pod_ip: String,
    /// Node name, from `KUBERNETES_NODE_NAME`.
    pub node: String,
    /// Namespace, from `KUBERNETES_NAMESPACE`.
    pub namespace: String,
    /// Worker threads available to the runtime.
    pub workers: usize,
}

fn env_or_empty(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

/// Reports that the process is up along with where it is running.
pub fn liveness(build: String) -> HandlerFunc {
    handler(move |_, _| {
        let build = build.clone();
        async move {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unavailable".to_string());
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);

            let info = Info {
                status: "up".to_string(),
                build,
                host,
                name: env_or_empty("KUBERNETES_NAME"),
                pod_ip: env_or_empty("KUBERNETES_POD_IP"),
                node: env_or_empty("KUBERNETES_NODE_NAME"),
                namespace: env_or_empty("KUBERNETES_NAMESPACE"),
                workers,
            };

            Ok(Json(info).into_response())
        }
    })
}

/// Reports whether the database answers within [`READINESS_TIMEOUT`].
pub fn readiness(db: Arc<dyn Beginner>) -> HandlerFunc {
    handler(move |scope, _| {
        let db = db.clone();
        async move {
            let outcome = match tokio::time::timeout(READINESS_TIMEOUT, db.status_check()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::DeadlineExceeded("status check timed out".to_string())),
            };

            if let Err(err) = outcome {
                info!(trace_id = %scope.trace_id(), error = %err, "readiness failure");
                return Err(AppError::Internal(format!("readiness: {}", err)));
            }

            Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
        }
    })
}

/// Debug counters payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugVars {
    /// Request, error and panic counters.
    pub metrics: MetricsSnapshot,
    /// Identity cache counters, sales only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_cache: Option<CacheStats>,
}

/// Exposes the process counters and, when present, identity cache stats.
pub fn debug_vars(metrics: Arc<Metrics>, cache: Option<Arc<ShardedCache<User>>>) -> HandlerFunc {
    handler(move |_, _| {
        let vars = DebugVars {
            metrics: metrics.snapshot(),
            identity_cache: cache.as_ref().map(|c| c.stats()),
        };
        async move { Ok(Json(vars).into_response()) }
    })
}
