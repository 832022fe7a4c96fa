use anyhow::Context as _;
use axum::{Router, routing::get};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod acl;
mod admin;
mod audit;
mod auth_middleware;
mod config;
mod oauth_http;
mod oauth_issuer;
mod oauth_upstream;
mod pg_store;
mod secrets;
mod store;
mod token_retention;
mod upstream_http;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "canopy-mcp-gateway")]
#[command(
    version,
    about = "MCP gateway auth core: OAuth 2.1 issuer + upstream OAuth client, ACLs, audit trail"
)]
struct CliArgs {
    /// Path to a gateway config file (YAML).
    #[arg(short = 'c', long = "config", env = "CANOPY_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string; without it the in-memory store backed by
    /// the config file is used.
    #[arg(long = "database-url", env = "CANOPY_GATEWAY_DATABASE_URL")]
    database_url: Option<String>,

    /// HTTP bind address (ip:port).
    #[arg(
        short = 'b',
        long,
        env = "CANOPY_GATEWAY_BIND",
        default_value = "127.0.0.1:8080"
    )]
    bind: String,

    /// Externally visible base URL (issuer). Defaults to the request's Host
    /// header when unset.
    #[arg(long = "public-url", env = "CANOPY_GATEWAY_PUBLIC_URL")]
    public_url: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "CANOPY_GATEWAY_LOG",
        default_value = "info"
    )]
    log_level: String,
}

/// Everything the HTTP boundary needs, built once at boot.
pub struct AppState {
    pub mode: config::ServerMode,
    pub initialized: bool,
    pub public_url: Option<String>,
    pub issuer: oauth_issuer::OAuthIssuer,
    pub upstream: oauth_upstream::UpstreamOAuth,
    pub audit: Arc<audit::AuditService>,
    pub audit_store: Arc<dyn store::AuditStore>,
    pub users: Arc<dyn store::UserStore>,
    pub mcp_clients: Arc<dyn store::McpClientStore>,
    pub tool_groups: Arc<dyn store::ToolGroupStore>,
    pub registry: Arc<dyn store::ToolRegistry>,
    pub upstream_sessions: Arc<dyn store::UpstreamSessionStore>,
    pub acl: acl::AclResolver,
}

impl AppState {
    /// Runtime configuration snapshot, as middleware consumes it.
    pub fn runtime_config(&self) -> config::RuntimeConfig {
        config::RuntimeConfig {
            initialized: self.initialized,
            mode: self.mode,
        }
    }
}

/// Store trait handles, from either backend.
struct Stores {
    issuer: Arc<dyn store::IssuerStore>,
    sessions: Arc<dyn store::UpstreamSessionStore>,
    users: Arc<dyn store::UserStore>,
    mcp_clients: Arc<dyn store::McpClientStore>,
    tool_groups: Arc<dyn store::ToolGroupStore>,
    registry: Arc<dyn store::ToolRegistry>,
    audit: Arc<dyn store::AuditStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting Canopy MCP Gateway v{VERSION}");
    run(args).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let (gateway_config, config_loaded) = load_config(&args).await?;

    let ct = CancellationToken::new();
    let stores = build_stores(&args, &gateway_config).await?;

    // Initialization gate: in config-file mode the config file itself is the
    // initialization artifact; in Postgres mode a provisioned user is.
    // Protected routes answer 403 until one of those exists.
    let initialized = if args.database_url.is_some() {
        stores.users.has_any_user().await?
    } else {
        config_loaded
    };
    if !initialized {
        tracing::warn!(
            "server is not initialized; API and MCP proxy requests will be rejected until a config file (or a provisioned user in Postgres mode) exists"
        );
    }

    let audit_service = audit::AuditService::new(stores.audit.clone(), ct.clone());
    let issuer = oauth_issuer::OAuthIssuer::new(stores.issuer.clone());
    let upstream = oauth_upstream::UpstreamOAuth::new(
        stores.sessions.clone(),
        oauth_upstream::build_http_client()?,
    );
    let resolver = acl::AclResolver::new(stores.tool_groups.clone(), stores.registry.clone());

    if gateway_config.mode.enforces_auth() {
        tracing::info!(mode = ?gateway_config.mode, "auth enforcement enabled");
    } else {
        tracing::warn!(
            "development mode: API and MCP proxy planes are UNAUTHENTICATED. Do not expose this bind address publicly."
        );
    }

    let state = Arc::new(AppState {
        mode: gateway_config.mode,
        initialized,
        public_url: args.public_url.clone(),
        issuer: issuer.clone(),
        upstream,
        audit: audit_service,
        audit_store: stores.audit,
        users: stores.users,
        mcp_clients: stores.mcp_clients,
        tool_groups: stores.tool_groups,
        registry: stores.registry,
        upstream_sessions: stores.sessions,
        acl: resolver,
    });

    token_retention::spawn_token_retention_task(issuer, ct.clone());

    let app = Router::new()
        .merge(oauth_http::router(state.clone()))
        .merge(oauth_http::authorize_router(state.clone()))
        .merge(upstream_http::router(state.clone()))
        .merge(upstream_http::callback_router(state.clone()))
        .merge(admin::router(state))
        .route("/health", get(health));

    let bind: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", args.bind))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind address '{bind}'"))?;
    let bound = listener.local_addr().context("get bind address")?;
    tracing::info!("Starting HTTP server on {bound}");

    spawn_shutdown_watcher(ct.clone());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        ct.cancelled().await;
    })
    .await?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

async fn load_config(args: &CliArgs) -> anyhow::Result<(config::GatewayConfig, bool)> {
    if let Some(path) = &args.config {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: config::GatewayConfig = serde_yaml::from_slice(&bytes)
            .with_context(|| format!("parse YAML config: {}", path.display()))?;
        Ok((cfg, true))
    } else {
        Ok((config::GatewayConfig::default(), false))
    }
}

async fn build_stores(args: &CliArgs, cfg: &config::GatewayConfig) -> anyhow::Result<Stores> {
    if let Some(database_url) = &args.database_url {
        tracing::info!(
            "Postgres mode. Ensure migrations have been applied (e.g. via dbmate over crates/gateway/migrations)."
        );
        if !cfg.users.is_empty() || !cfg.mcp_clients.is_empty() || !cfg.tool_groups.is_empty() {
            tracing::warn!(
                "config-file identity seeds are ignored in Postgres mode; provision them in the database"
            );
        }

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to Postgres")?;
        let pg = pg_store::PostgresStore::new(pool);
        pg.ensure_schema().await?;
        let pg = Arc::new(pg);

        Ok(Stores {
            issuer: pg.clone(),
            sessions: pg.clone(),
            users: pg.clone(),
            mcp_clients: pg.clone(),
            tool_groups: pg.clone(),
            registry: pg.clone(),
            audit: pg,
        })
    } else {
        let mem = Arc::new(store::MemoryStore::from_config(cfg));
        Ok(Stores {
            issuer: mem.clone(),
            sessions: mem.clone(),
            users: mem.clone(),
            mcp_clients: mem.clone(),
            tool_groups: mem.clone(),
            registry: mem.clone(),
            audit: mem,
        })
    }
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

async fn health() -> &'static str {
    "ok"
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human-readable on a TTY, JSON otherwise.
    let is_tty = atty::is(atty::Stream::Stdout);

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
