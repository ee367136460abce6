//! Configuration loading.
//!
//! [`TollgateConfig`] is assembled from defaults, an optional
//! `tollgate.toml` in the working directory, and `TOLLGATE__`-prefixed
//! environment variables (for example `TOLLGATE__ENGINE__REQUIRE_MONITORING_ENTRIES=true`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::catalog::{
    STAGE_CLOSURE, STAGE_DEFINE_RESPONSIBILITIES, STAGE_PERIODIC_REVIEW, STAGE_REGISTER,
    STAGE_SAVINGS_MONITORING, STAGE_SAVINGS_VALIDATION, STAGE_SITE_HEAD_APPROVAL,
    STAGE_TRIAL_IMPLEMENTATION,
};
use crate::role::{Identity, RoleCode};
use crate::Result;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

const CONFIG_FILE: &str = "tollgate";
const ENV_PREFIX: &str = "TOLLGATE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    /// Engine behaviour.
    pub engine: EngineSettings,
    /// Static role roster seeded at setup.
    pub seed: SeedConfig,
}

/// Tunables of the transition engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,

    /// Refuse to complete the savings stages while an initiative has no
    /// monitoring entries at all.
    pub require_monitoring_entries: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            require_monitoring_entries: false,
        }
    }
}

/// Site rosters for the fixed stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// One roster per site.
    pub sites: Vec<SiteRoster>,
}

/// The static assignments of one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRoster {
    /// Site code.
    pub site: String,
    /// Stage holders.
    #[serde(default)]
    pub assignments: Vec<SeedAssignment>,
}

/// One seeded stage holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedAssignment {
    /// Stage number.
    pub stage: u32,
    /// Role held; must match the catalog.
    pub role: RoleCode,
    /// Holder.
    pub identity: Identity,
}

impl SeedAssignment {
    /// Creates a seed assignment.
    pub fn new(stage: u32, role: RoleCode, identity: impl Into<Identity>) -> Self {
        Self {
            stage,
            role,
            identity: identity.into(),
        }
    }
}

impl SeedConfig {
    /// The built-in roster for the `NDS` demo site.
    ///
    /// Covers every fixed stage; the Initiative-Lead stages 4, 5 and 6 are
    /// left for the engine to bind.
    pub fn demo() -> Self {
        use RoleCode::*;

        let assignments = vec![
            SeedAssignment::new(STAGE_REGISTER, SiteTsdLead, "stld@nds.example"),
            SeedAssignment::new(STAGE_SITE_HEAD_APPROVAL, SiteHead, "sh@nds.example"),
            SeedAssignment::new(STAGE_DEFINE_RESPONSIBILITIES, EngineeringHead, "eh@nds.example"),
            SeedAssignment::new(STAGE_TRIAL_IMPLEMENTATION, SiteTsdLead, "trial@nds.example"),
            SeedAssignment::new(STAGE_PERIODIC_REVIEW, CorporateTsd, "ctsd@nds.example"),
            SeedAssignment::new(STAGE_SAVINGS_MONITORING, SiteTsdLead, "monitoring@nds.example"),
            SeedAssignment::new(STAGE_SAVINGS_VALIDATION, SiteTsdLead, "validation@nds.example"),
            SeedAssignment::new(STAGE_CLOSURE, SiteTsdLead, "closure@nds.example"),
        ];
        Self {
            sites: vec![SiteRoster {
                site: "NDS".to_string(),
                assignments,
            }],
        }
    }
}

impl TollgateConfig {
    /// Loads configuration with precedence:
    /// 1. Default values
    /// 2. `tollgate.toml` in the working directory, if present
    /// 3. Environment variables prefixed with `TOLLGATE__`
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("tollgate.toml").exists() {
            builder = builder.add_source(File::with_name(CONFIG_FILE));
        }

        builder = builder.add_source(Self::environment());

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Loads configuration from an explicit file, then the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parses a TOML document. The environment is not consulted.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }
}
