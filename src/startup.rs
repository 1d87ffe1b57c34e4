//! Server startup and wiring.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use gateway_core::messages::{self, COMMON_PROJECT};
use gateway_core::{JwtValidator, MessageCatalog};
use gateway_telemetry::{PrometheusHandle, init_metrics, setup_telemetry};
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::metadata::MetadataBridge;
use crate::pipeline::Pipeline;
use crate::providers::{
    AppProvider, CryptProvider, JwtUserProvider, PermissionProvider, SignProvider, UserProvider,
};
use crate::routes::{health_routes, health_routes_with_metrics};

/// Build version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Providers for the stages. A missing provider leaves its stage off.
#[derive(Default, Clone)]
pub struct Providers {
    pub app: Option<Arc<dyn AppProvider>>,
    pub crypt: Option<Arc<dyn CryptProvider>>,
    pub user: Option<Arc<dyn UserProvider>>,
    pub sign: Option<Arc<dyn SignProvider>>,
    pub permission: Option<Arc<dyn PermissionProvider>>,
}

/// Pipeline configured from `config`.
///
/// Without a user provider, a configured JWT secret enables the JWT provider.
pub fn build_pipeline(config: &Config, providers: Providers) -> Result<Pipeline, ConfigError> {
    let mut builder = Pipeline::builder()
        .headers(config.header_names()?)
        .project(config.project_id)
        .app_validation(config.app_validation)
        .provider_timeout(config.provider_timeout())
        .debug_errors(config.debug_errors)
        .path_prefix(config.path_prefix.as_str())
        .max_body_bytes(config.max_body_bytes)
        .require_token(config.require_token);

    let user = providers.user.or_else(|| {
        config.jwt_secret_key.as_ref().map(|secret| {
            let validator = JwtValidator::new(secret, config.jwt_issuer.as_str());
            Arc::new(JwtUserProvider::new(validator)) as Arc<dyn UserProvider>
        })
    });

    if let Some(app) = providers.app {
        builder = builder.app_provider(app);
    }
    if let Some(crypt) = providers.crypt {
        builder = builder.crypt_provider(crypt);
    }
    if let Some(user) = user {
        builder = builder.user_provider(user);
    }
    if let Some(sign) = providers.sign {
        builder = builder.sign_provider(sign);
    }
    if let Some(permission) = providers.permission {
        builder = builder.permission_provider(permission);
    }

    Ok(builder.build())
}

/// Metadata bridge for `pipeline` in the configured mode.
pub fn build_metadata(config: &Config, pipeline: &Pipeline) -> MetadataBridge {
    let bridge = pipeline.metadata_bridge().with_identity();
    if config.metadata_all_headers {
        bridge.forward_all()
    } else {
        bridge
    }
}

/// Load `<lang>.json` files from the messages directory.
///
/// Files directly in the directory hold common messages; files under a
/// subdirectory named after the project id hold project messages.
pub fn load_messages(config: &Config) -> anyhow::Result<MessageCatalog> {
    let mut catalog = MessageCatalog::new().with_default_language(&config.default_language);
    let Some(dir) = &config.messages_dir else {
        return Ok(catalog);
    };

    load_dir(&mut catalog, COMMON_PROJECT, dir)?;
    let project_dir = dir.join(config.project_id.to_string());
    if config.project_id != COMMON_PROJECT && project_dir.is_dir() {
        load_dir(&mut catalog, config.project_id, &project_dir)?;
    }
    Ok(catalog)
}

fn load_dir(catalog: &mut MessageCatalog, project: u32, dir: &Path) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(language) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        catalog
            .load(project, language, &data)
            .with_context(|| format!("loading {}", path.display()))?;
        info!(project, language, "Loaded messages");
    }
    Ok(())
}

/// Health routes plus the pipeline-wrapped RPC routes.
pub fn build_app(pipeline: &Pipeline, routes: Router, metrics: Option<PrometheusHandle>) -> Router {
    let stages = pipeline.stages();
    let health = match metrics {
        Some(handle) => health_routes_with_metrics(&stages, handle),
        None => health_routes(&stages),
    };
    health.merge(pipeline.apply(routes))
}

/// Run the gateway until Ctrl+C or SIGTERM.
///
/// `routes` builds the RPC router; it receives the metadata bridge for
/// outgoing calls.
pub async fn run<F>(config: Config, providers: Providers, routes: F) -> anyhow::Result<()>
where
    F: FnOnce(MetadataBridge) -> Router,
{
    let telemetry = setup_telemetry(&config.telemetry())?;
    let metrics = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    messages::install(load_messages(&config)?);

    let pipeline = build_pipeline(&config, providers)?;
    let addr = config.socket_addr()?;
    info!(
        version = VERSION,
        address = %addr,
        prefix = pipeline.prefix().unwrap_or("/"),
        stages = ?pipeline.stages(),
        pid = std::process::id(),
        "Starting api-gateway"
    );

    let app = build_app(&pipeline, routes(build_metadata(&config, &pipeline)), metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
