use crate::api::handlers::{auth, check, users};
use crate::auth::jwt::AuthService;
use crate::auth::middleware::{self as authmid, Authenticator};
use crate::auth::policy::{RULE_ADMIN_ONLY, RULE_ADMIN_OR_SUBJECT};
use crate::db::Beginner;
use crate::metrics::Metrics;
use crate::users::cache::ShardedCache;
use crate::users::{ExtBusiness, User};
use crate::web::{mid, App, MidFunc, MAX_BODY_BYTES};
use axum::http::{header, HeaderValue, Method};
use axum::routing::MethodFilter;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

const VERSION: &str = "v1";

/// Everything the auth service routes need.
pub struct AuthConfig {
    /// Build tag reported by liveness.
    pub build: String,
    /// Token engine and key store.
    pub auth: Arc<AuthService>,
    /// User business layer.
    pub users: Arc<dyn ExtBusiness>,
    /// Transaction source for the readiness check.
    pub db: Arc<dyn Beginner>,
    /// Process counters.
    pub metrics: Arc<Metrics>,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
}

/// Everything the sales service routes need.
pub struct SalesConfig {
    /// Build tag reported by liveness.
    pub build: String,
    /// Authenticates and authorizes through the auth service.
    pub auth: Arc<dyn Authenticator>,
    /// User business layer.
    pub users: Arc<dyn ExtBusiness>,
    /// Transaction source for write routes.
    pub db: Arc<dyn Beginner>,
    /// Process counters.
    pub metrics: Arc<Metrics>,
    /// Identity cache exposed on the debug route.
    pub identity_cache: Option<Arc<ShardedCache<User>>>,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
}

/// The application chain every routed handler runs inside, outermost first.
pub fn app_middleware(metrics: Arc<Metrics>, request_timeout: Duration) -> Vec<MidFunc> {
    vec![
        mid::logger(),
        mid::errors(),
        mid::metrics(metrics),
        mid::panics(),
        mid::deadline(request_timeout),
    ]
}

fn add_checks(
    app: &mut App,
    build: String,
    db: Arc<dyn Beginner>,
    metrics: Arc<Metrics>,
    cache: Option<Arc<ShardedCache<User>>>,
) {
    app.handle_no_mid(MethodFilter::GET, VERSION, "/liveness", check::liveness(build));
    app.handle_no_mid(MethodFilter::GET, VERSION, "/readiness", check::readiness(db));
    app.handle_no_mid(MethodFilter::GET, "", "/debug/vars", check::debug_vars(metrics, cache));
}

/// Builds the auth service: token issuing plus authentication and
/// authorization decisions for other services.
pub fn auth_app(cfg: AuthConfig) -> Router {
    let mut app = App::new(app_middleware(cfg.metrics.clone(), cfg.request_timeout));

    app.handle(
        MethodFilter::GET,
        VERSION,
        "/auth/token/{kid}",
        auth::token(cfg.auth.clone()),
        vec![authmid::basic(cfg.auth.clone(), cfg.users.clone())],
    );
    app.handle(
        MethodFilter::GET,
        VERSION,
        "/auth/authenticate",
        auth::authenticate(),
        vec![authmid::bearer(cfg.auth.clone())],
    );
    app.handle(
        MethodFilter::POST,
        VERSION,
        "/auth/authorize",
        auth::authorize(cfg.auth.clone()),
        vec![],
    );

    add_checks(&mut app, cfg.build, cfg.db, cfg.metrics, None);

    finish(app, &cfg.cors_origins)
}

/// Builds the sales service, which delegates every auth decision.
pub fn sales_app(cfg: SalesConfig) -> Router {
    let mut app = App::new(app_middleware(cfg.metrics.clone(), cfg.request_timeout));

    app.handle(
        MethodFilter::POST,
        VERSION,
        "/users",
        users::create(cfg.users.clone()),
        vec![
            mid::begin_commit_rollback(cfg.db.clone()),
            authmid::authenticate(cfg.auth.clone()),
            authmid::authorize(cfg.auth.clone(), RULE_ADMIN_ONLY),
        ],
    );
    app.handle(
        MethodFilter::DELETE,
        VERSION,
        "/users/{user_id}",
        users::delete(cfg.users.clone()),
        vec![
            mid::begin_commit_rollback(cfg.db.clone()),
            authmid::authenticate(cfg.auth.clone()),
            authmid::authorize_user(cfg.auth.clone(), RULE_ADMIN_OR_SUBJECT),
        ],
    );

    add_checks(&mut app, cfg.build, cfg.db, cfg.metrics, cfg.identity_cache);

    finish(app, &cfg.cors_origins)
}

fn finish(app: App, cors_origins: &[String]) -> Router {
    // Cors needs a `Default` response body, so the limit sits outside it.
    let layers = ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(build_cors_layer(cors_origins));

    app.into_router().layer(layers)
}

/// Builds the CORS layer. A single `*` entry allows any origin.
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let is_wildcard = origins.is_empty() || (origins.len() == 1 && origins[0] == "*");

    if is_wildcard {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600));
    }

    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-trace-id"),
        ])
        .max_age(Duration::from_secs(3600))
}
