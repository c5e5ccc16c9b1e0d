//! Process-wide handles, built once at startup and injected into every request.

use std::sync::Arc;

use db::DBService;
use rpc::{ContextFactory, Registry, RegistryError};
use secrecy::ExposeSecret;
use services::services::{
    ai::{AiClient, AiError},
    auth::AuthService,
    cleanup::SessionCleanupService,
    config::{Config, ConfigError},
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ai(#[from] AiError),
}

#[derive(Clone)]
pub struct Deployment {
    config: Arc<Config>,
    db: DBService,
    auth: AuthService,
    ai: AiClient,
    registry: Arc<Registry>,
    contexts: ContextFactory,
}

impl Deployment {
    /// Connect to the configured database and wire every service around it.
    pub async fn new<F>(config: Config, build_registry: F) -> Result<Self, DeploymentError>
    where
        F: FnOnce(&AiClient) -> Result<Registry, RegistryError>,
    {
        let db = DBService::new(&config.database_url).await?;
        Self::assemble(config, db, build_registry)
    }

    /// Wire services around an existing database handle.
    pub fn assemble<F>(config: Config, db: DBService, build_registry: F) -> Result<Self, DeploymentError>
    where
        F: FnOnce(&AiClient) -> Result<Registry, RegistryError>,
    {
        let auth = AuthService::new(
            db.clone(),
            config.auth_secret.expose_secret().as_bytes(),
            config.secure_cookies(),
        );
        let ai = AiClient::new(config.anthropic_api_key.clone(), None)?;
        let registry = Arc::new(build_registry(&ai)?);
        let contexts = ContextFactory::new(db.clone(), Arc::new(auth.clone()));
        info!(
            env = %config.app_env,
            procedures = registry.paths().count(),
            ai_enabled = ai.is_configured(),
            "Deployment ready"
        );
        Ok(Self {
            config: Arc::new(config),
            db,
            auth,
            ai,
            registry,
            contexts,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn ai(&self) -> &AiClient {
        &self.ai
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn contexts(&self) -> &ContextFactory {
        &self.contexts
    }

    pub fn spawn_background_services(&self) -> Vec<JoinHandle<()>> {
        vec![SessionCleanupService::spawn(self.db.clone())]
    }
}
