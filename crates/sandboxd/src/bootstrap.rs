//! Build server bootstrap orchestration.

use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use sandboxfs_config::{Config, RuntimePaths, RuntimePathsError};
use sandboxfs_supervisor::{
    ControllerSettings, MountPointManager, ProcessSupervisor, SandboxLifecycleController,
};

use crate::health::HealthReporter;
use crate::server::BuildServer;
use crate::telemetry::{self, TelemetryError};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the build server configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader that hands out a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already loaded configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The sandbox base directory could not be prepared.
    #[error("failed to prepare runtime paths: {source}")]
    Runtime {
        /// Underlying filesystem error.
        #[source]
        source: RuntimePathsError,
    },
}

/// Bootstraps the build server using the supplied collaborators.
///
/// No sandbox is launched here; the first build that enables the sandbox
/// starts one.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
) -> Result<BuildServer, BootstrapError> {
    reporter.bootstrap_starting();

    let config = match loader.load() {
        Ok(config) => config,
        Err(source) => {
            let error = BootstrapError::Configuration { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let telemetry = match telemetry::initialise(&config) {
        Ok(handle) => handle,
        Err(source) => {
            let error = BootstrapError::Telemetry { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let paths = match RuntimePaths::from_config(&config) {
        Ok(paths) => paths,
        Err(source) => {
            let error = BootstrapError::Runtime { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let launcher = ProcessSupervisor::new()
        .with_ready_timeout(config.ready_timeout())
        .with_drop_grace(config.terminate_timeout());
    let controller = SandboxLifecycleController::new(
        launcher,
        MountPointManager::new(paths.sandbox_base_dir()),
        ControllerSettings::from_config(&config),
    );
    reporter.bootstrap_succeeded(&config);

    Ok(BuildServer::new(config, controller, telemetry, reporter))
}
