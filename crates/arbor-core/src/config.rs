//! Global configuration.
//!
//! Configuration only changes how much checking and reporting the engine
//! does; it never changes reconciliation results. A [`Config`] is injected
//! into each [`Reconciler`](crate::Reconciler). The process-wide copy set
//! through [`install_global`] is only read when a reconciler is created
//! without an explicit config.

use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Check values the engine cannot verify statically (portal targets,
    /// provider values).
    pub type_checks: bool,
    /// Verify arena links after every child diff.
    pub internal_type_checks: bool,
    /// Include element creation sites in error messages.
    pub element_tracing: bool,
    /// Run `validate_props` on class components.
    pub prop_validation: bool,
    /// Maximum number of render passes a single flush may take before the
    /// reconciler gives up with [`Error::UpdateLoop`].
    pub max_update_passes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            type_checks: false,
            internal_type_checks: false,
            element_tracing: false,
            prop_validation: false,
            max_update_passes: 100,
        }
    }
}

impl Config {
    /// Keys accepted by [`Config::set`].
    pub const KEYS: [&'static str; 4] = [
        "typeChecks",
        "internalTypeChecks",
        "elementTracing",
        "propValidation",
    ];

    /// Set a boolean flag by name.
    ///
    /// Unknown keys are rejected immediately.
    pub fn set(&mut self, key: &str, value: bool) -> Result<()> {
        let flag = match key {
            "typeChecks" => &mut self.type_checks,
            "internalTypeChecks" => &mut self.internal_type_checks,
            "elementTracing" => &mut self.element_tracing,
            "propValidation" => &mut self.prop_validation,
            _ => {
                return Err(Error::Config {
                    key: key.to_string(),
                    reason: format!("unknown key, expected one of {:?}", Self::KEYS),
                });
            }
        };
        *flag = value;
        Ok(())
    }

    /// Builder form of [`Config::set`].
    pub fn with(mut self, key: &str, value: bool) -> Result<Self> {
        self.set(key, value)?;
        Ok(self)
    }

    /// Set the flush pass limit. Zero is rejected.
    pub fn with_max_update_passes(mut self, passes: usize) -> Result<Self> {
        if passes == 0 {
            return Err(Error::Config {
                key: "maxUpdatePasses".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        self.max_update_passes = passes;
        Ok(self)
    }

    /// Config with every check enabled.
    pub fn strict() -> Self {
        Self {
            type_checks: true,
            internal_type_checks: true,
            element_tracing: true,
            prop_validation: true,
            ..Self::default()
        }
    }
}

static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the process-wide configuration. May only happen once.
pub fn install_global(config: Config) -> Result<()> {
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| Error::ConfigAlreadyInstalled)
}

/// The installed process-wide configuration, or the default.
pub fn global() -> Config {
    GLOBAL_CONFIG.get().cloned().unwrap_or_default()
}
