use anyhow::{bail, Context};
use gatehouse::api::routes::{self, AuthConfig, SalesConfig};
use gatehouse::auth::client::AuthClient;
use gatehouse::auth::jwt::AuthService;
use gatehouse::auth::keystore::KeyStore;
use gatehouse::cli::{Cli, Commands};
use gatehouse::db::Beginner;
use gatehouse::delegate::Delegate;
use gatehouse::metrics::Metrics;
use gatehouse::users::cache::CachedUserStore;
use gatehouse::users::memory::MemoryDb;
use gatehouse::users::{self, Email, NewUser, Role, UserStore};
use gatehouse::utils::config::{ConfigError, GatehouseConfig, ServerConfig};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const BUILD: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    let config = GatehouseConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Auth => {
            init_tracing(&config.server, "AUTH", cli.verbose);
            run_auth(config).await
        }
        Commands::Sales => {
            init_tracing(&config.server, "SALES", cli.verbose);
            run_sales(config).await
        }
        Commands::Config { full, validate } => show_config(&config, full, validate),
        Commands::Useradd {
            name,
            email,
            password,
            roles,
            department,
        } => {
            let roles = roles
                .iter()
                .map(|r| Role::from_str(r))
                .collect::<Result<Vec<_>, _>>()?;
            let nu = NewUser {
                name,
                email: Email::parse(&email)?,
                roles,
                department,
                password,
            };
            useradd(&config, nu).await
        }
        Commands::Gentoken {
            user_id,
            roles,
            ttl_secs,
        } => gentoken(&config, user_id, roles, ttl_secs),
    }
}

fn init_tracing(cfg: &ServerConfig, service: &str, verbose: bool) {
    let level = if verbose { "debug" } else { cfg.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(service, build = BUILD, "startup");
}

/// The transaction source and user store for the configured database.
async fn open_store(config: &GatehouseConfig) -> anyhow::Result<(Arc<dyn Beginner>, Arc<dyn UserStore>)> {
    if config.database.is_memory() {
        let db = MemoryDb::new();
        let beginner: Arc<dyn Beginner> = Arc::new(db.clone());
        return Ok((beginner, db.store()));
    }

    open_local(config).await
}

#[cfg(feature = "local-db")]
async fn open_local(config: &GatehouseConfig) -> anyhow::Result<(Arc<dyn Beginner>, Arc<dyn UserStore>)> {
    if let Some(parent) = Path::new(&config.database.url).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let db = Arc::new(gatehouse::db::SqliteDb::new_local(&config.database.url).await?);
    let store: Arc<dyn UserStore> = Arc::new(users::sqlite::SqliteUserStore::new(db.clone()));
    let beginner: Arc<dyn Beginner> = db;
    Ok((beginner, store))
}

#[cfg(not(feature = "local-db"))]
async fn open_local(config: &GatehouseConfig) -> anyhow::Result<(Arc<dyn Beginner>, Arc<dyn UserStore>)> {
    bail!(
        "database.url '{}' needs the local-db feature, use ':memory:' instead",
        config.database.url
    )
}

fn load_keys(config: &GatehouseConfig) -> anyhow::Result<KeyStore> {
    let mut keys = KeyStore::new();
    match config.keys_document() {
        Ok(document) => {
            keys.load_by_json(&document)?;
        }
        Err(ConfigError::MissingEnvVar(var)) => debug!(%var, "no key document in environment"),
        Err(e) => return Err(e.into()),
    }

    if !config.auth.keys_folder.is_empty() {
        keys.load_by_file_system(Path::new(&config.auth.keys_folder))?;
    }

    if keys.is_empty() {
        bail!(
            "no signing keys: set {} or populate {}",
            config.auth.keys_env,
            config.auth.keys_folder
        );
    }

    info!(kids = ?keys.kids(), "keys loaded");
    Ok(keys)
}

fn token_engine(config: &GatehouseConfig, keys: KeyStore) -> anyhow::Result<AuthService> {
    Ok(AuthService::new(Arc::new(keys), config.auth.issuer.clone())?
        .with_clock_skew(config.auth.clock_skew_secs))
}

async fn run_auth(config: GatehouseConfig) -> anyhow::Result<()> {
    let keys = load_keys(&config)?;
    if !keys.kids().contains(&config.auth.active_kid) {
        warn!(kid = %config.auth.active_kid, "active kid is not loaded");
    }
    let auth = Arc::new(token_engine(&config, keys)?);

    let (db, store) = open_store(&config).await?;
    let delegate = Arc::new(Delegate::new());
    let users = users::new_business(delegate, store, vec![users::trace::extension()]);

    let router = routes::auth_app(AuthConfig {
        build: BUILD.to_string(),
        auth,
        users,
        db,
        metrics: Arc::new(Metrics::new()),
        request_timeout: config.server.request_timeout(),
        cors_origins: config.server.cors_origins.clone(),
    });

    serve(&config.server, router).await
}

async fn run_sales(config: GatehouseConfig) -> anyhow::Result<()> {
    let (db, store) = open_store(&config).await?;

    let cached = CachedUserStore::new(store, config.sales.cache_shards, config.sales.cache_ttl());
    let cache = cached.cache().clone();

    let delegate = Arc::new(Delegate::new());
    delegate.register(users::DOMAIN, users::ACTION_DELETED, |data| async move {
        info!(domain = %data.domain, action = %data.action, params = %data.params, "audit");
        Ok(())
    });

    let users = users::new_business(delegate, Arc::new(cached), vec![users::trace::extension()]);

    let auth = AuthClient::new(&config.sales.auth_host)
        .with_authorize_timeout(config.sales.authorize_timeout());
    info!(host = %config.sales.auth_host, "delegating auth");

    let router = routes::sales_app(SalesConfig {
        build: BUILD.to_string(),
        auth: Arc::new(auth),
        users,
        db,
        metrics: Arc::new(Metrics::new()),
        identity_cache: Some(cache),
        request_timeout: config.server.request_timeout(),
        cors_origins: config.server.cors_origins.clone(),
    });

    serve(&config.server, router).await
}

async fn serve(server: &ServerConfig, router: axum::Router) -> anyhow::Result<()> {
    let addr = server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!(%addr, "api router started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn show_config(config: &GatehouseConfig, full: bool, validate: bool) -> anyhow::Result<()> {
    if validate {
        let warnings = config.validate_with_warnings()?;
        if warnings.is_empty() {
            println!("configuration is valid");
        } else {
            println!("configuration is valid with {} warning(s):", warnings.len());
            for w in &warnings {
                println!("  - {}", w);
            }
        }
    }

    if full {
        println!("{}", toml::to_string_pretty(config)?);
    } else if !validate {
        println!("server:   {}", config.server.addr());
        println!("issuer:   {}", config.auth.issuer);
        println!("database: {}", config.database.url);
        println!("auth:     {}", config.sales.auth_host);
    }

    Ok(())
}

async fn useradd(config: &GatehouseConfig, nu: NewUser) -> anyhow::Result<()> {
    let (db, store) = open_store(config).await?;
    let bus = users::new_business(Arc::new(Delegate::new()), store, vec![]);

    let tx = db.begin().await?;
    let user = match bus.with_tx(&tx)?.create(Uuid::nil(), nu).await {
        Ok(user) => user,
        Err(e) => {
            tx.rollback().await?;
            return Err(e.into());
        }
    };
    tx.commit().await?;

    println!("user id: {}", user.id);
    Ok(())
}

fn gentoken(config: &GatehouseConfig, user_id: Uuid, roles: Vec<String>, ttl_secs: i64) -> anyhow::Result<()> {
    let roles = roles
        .iter()
        .map(|r| Role::from_str(r).map(|role| role.as_str().to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    let auth = token_engine(config, load_keys(config)?)?;
    let claims = auth.new_claims(user_id, roles, ttl_secs);
    let token = auth.generate_token(&config.auth.active_kid, &claims)?;

    println!("{}", token);
    Ok(())
}
