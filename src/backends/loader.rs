//! Backend loader for initializing backends from configuration

use super::local::LocalBackend;
use super::registry::BackendRegistry;
use super::remote::RemoteBackend;
use crate::config::Settings;
use crate::network::RequestGate;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Loader for initializing backends from configuration
pub struct BackendLoader;

impl BackendLoader {
    /// Build the registry described by `settings`
    pub fn load(settings: &Settings) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();

        if settings.local.enabled {
            match LocalBackend::from_settings(&settings.local) {
                Some(local) => {
                    info!("Loaded local backend: {}", local.database().display());
                    registry.register(Arc::new(local));
                }
                None => warn!("Local backend enabled without a database; skipping"),
            }
        } else {
            info!("Skipping disabled backend: local");
        }

        if settings.remote.enabled {
            let gate = Arc::new(RequestGate::new(settings.remote.request_spacing()));
            let remote = RemoteBackend::from_settings(&settings.remote, gate)?;
            info!("Loaded remote backend: {}", settings.remote.base_url);
            registry.register(Arc::new(remote));
        } else {
            info!("Skipping disabled backend: remote");
        }

        info!("Loaded {} backends", registry.len());
        Ok(registry)
    }
}
