//! Registry access service binary.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use counters::CounterConfig;
use eyre::WrapErr;
use metadata::MetadataConfig;
use registry::config::AdminConfig;
use registry::credentials::{MAX_TOKEN_LIFETIME_HOURS, TOKEN_LIFETIME_HOURS};
use registry::{Operation, RegistryBuilder, RegistryConfig};
use secret::Secret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DbBackend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Registry metadata and access-control API
#[derive(Parser, Debug)]
#[command(name = "registry-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    port: u16,

    /// Metadata store backend
    #[arg(long, env = "DB_BACKEND", value_enum, default_value_t = DbBackend::Postgres)]
    db_backend: DbBackend,

    /// SQLite database file
    #[arg(long, env = "DB_PATH", default_value = "registry.db")]
    db_path: PathBuf,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "registry")]
    db_name: String,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "postgres", hide_env_values = true)]
    db_password: String,

    /// Counter cache backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value_t = CacheBackend::Redis)]
    cache_backend: CacheBackend,

    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Seconds an in-memory counter survives its last write
    #[arg(long, env = "CACHE_TTL_SECS")]
    cache_ttl_secs: Option<u64>,

    /// Token signing secret
    #[arg(
        long,
        env = "JWT_SECRET",
        default_value = registry::config::DEFAULT_JWT_SECRET,
        hide_env_values = true,
        hide_default_value = true
    )]
    jwt_secret: String,

    /// Hours an issued token stays valid
    #[arg(
        long,
        env = "TOKEN_LIFETIME_HOURS",
        default_value_t = TOKEN_LIFETIME_HOURS,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_TOKEN_LIFETIME_HOURS))
    )]
    token_lifetime_hours: u32,

    /// Host of the blob-transfer endpoint
    #[arg(long, env = "REGISTRY_URL", default_value = "localhost")]
    registry_url: String,

    #[arg(long, env = "REGISTRY_PORT", default_value_t = 5000)]
    registry_port: u16,

    /// Administrator to create at start-up
    #[arg(long, env = "ADMIN_USERNAME", requires = "admin_password")]
    admin_username: Option<String>,

    #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    #[arg(long, env = "ADMIN_EMAIL", default_value = "admin@localhost")]
    admin_email: String,

    /// Operations only the admin role may perform, comma separated
    #[arg(long, env = "POLICY_ADMIN_ONLY", value_delimiter = ',')]
    policy_admin_only: Vec<Operation>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn registry_config(&self) -> RegistryConfig {
        let metadata = match self.db_backend {
            DbBackend::Memory => MetadataConfig::Memory,
            DbBackend::Sqlite => MetadataConfig::Sqlite {
                path: self.db_path.clone(),
            },
            DbBackend::Postgres => MetadataConfig::Postgres {
                host: self.db_host.clone(),
                port: self.db_port,
                database: self.db_name.clone(),
                username: self.db_user.clone(),
                password: Secret::from(self.db_password.clone()),
            },
        };

        let counters = match self.cache_backend {
            CacheBackend::Memory => CounterConfig::Memory {
                ttl_secs: self.cache_ttl_secs,
            },
            CacheBackend::Redis => CounterConfig::Redis {
                host: self.redis_host.clone(),
                port: self.redis_port,
            },
        };

        let admin = match (&self.admin_username, &self.admin_password) {
            (Some(username), Some(password)) => Some(AdminConfig {
                username: username.clone(),
                password: Secret::from(password.clone()),
                email: self.admin_email.clone(),
            }),
            _ => None,
        };

        RegistryConfig {
            metadata,
            counters,
            jwt_secret: Secret::from(self.jwt_secret.clone()),
            token_lifetime_hours: self.token_lifetime_hours,
            registry_url: format!("{}:{}", self.registry_url, self.registry_port),
            admin,
            admin_only: self.policy_admin_only.clone(),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C"),
            Err(error) => tracing::error!(%error, "failed to listen for Ctrl+C"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("received SIGTERM");
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let service = args
        .registry_config()
        .build()
        .await
        .wrap_err("assembling registry service")?;
    let app = RegistryBuilder::new(service).build();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "registry API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving registry API")?;

    tracing::info!("shut down");
    Ok(())
}
