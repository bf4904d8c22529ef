//! Project configuration
//!
//! Layers, lowest first: built-in defaults, `tether-project.yaml` in the
//! project directory, then `TETHER_*` environment variables (`__` separates
//! nested keys, e.g. `TETHER_SSH__USER=deploy`).

use crate::error::{Result, TetherError};
use crate::models::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::target::{TransportConfig, TransportKind};
use crate::transports::validate_options;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PROJECT_FILE: &str = "tether-project.yaml";

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplyConfig {
    /// Task that installs the apply agent on targets lacking the `agent` feature
    #[serde(default, alias = "install_task")]
    pub install_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default = "default_true", alias = "save_rerun")]
    pub save_rerun: bool,

    #[serde(default = "default_rerun_file", alias = "rerun_file")]
    pub rerun_file: PathBuf,

    #[serde(default = "default_inventory_file", alias = "inventory_file")]
    pub inventory_file: PathBuf,

    /// Per-target timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default = "default_cancel_grace", alias = "cancel_grace")]
    pub cancel_grace: u64,

    /// Transport for targets written without a scheme
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub ssh: Map<String, Value>,
    #[serde(default)]
    pub winrm: Map<String, Value>,
    #[serde(default)]
    pub local: Map<String, Value>,
    #[serde(default)]
    pub docker: Map<String, Value>,
    #[serde(default)]
    pub remote: Map<String, Value>,
    #[serde(default)]
    pub pcp: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_rerun_file() -> PathBuf {
    PathBuf::from(".tether/rerun.json")
}

fn default_inventory_file() -> PathBuf {
    PathBuf::from("inventory.yaml")
}

fn default_cancel_grace() -> u64 {
    5
}

fn default_transport() -> TransportKind {
    TransportKind::Ssh
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            save_rerun: true,
            rerun_file: default_rerun_file(),
            inventory_file: default_inventory_file(),
            timeout: None,
            cancel_grace: default_cancel_grace(),
            transport: default_transport(),
            format: OutputFormat::Human,
            apply: ApplyConfig::default(),
            ssh: Map::new(),
            winrm: Map::new(),
            local: Map::new(),
            docker: Map::new(),
            remote: Map::new(),
            pcp: Map::new(),
        }
    }
}

impl ProjectConfig {
    /// Load the layered configuration for a project directory
    pub fn load(project_root: &Path) -> Result<Self> {
        let file = project_root.join(PROJECT_FILE);
        debug!("Loading project configuration from {}", file.display());

        let settings = config::Config::builder()
            .add_source(File::from(file).format(FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix("TETHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ProjectConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system cannot
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(TetherError::Validation(
                "concurrency must be a positive integer".to_string(),
            ));
        }
        for kind in TransportKind::ALL {
            validate_options(kind, &self.transport_options(kind))?;
        }
        Ok(())
    }

    /// Project-level default options for one transport
    pub fn transport_options(&self, kind: TransportKind) -> TransportConfig {
        let table = match kind {
            TransportKind::Ssh => &self.ssh,
            TransportKind::Winrm => &self.winrm,
            TransportKind::Local => &self.local,
            TransportKind::Docker => &self.docker,
            TransportKind::Remote => &self.remote,
            TransportKind::Orchestrator => &self.pcp,
        };
        TransportConfig::from_map(table.clone())
    }

    /// Configured concurrency, or the file-descriptor derived default
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    pub fn rerun_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.rerun_file)
    }

    pub fn inventory_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.inventory_file)
    }
}

/// `min(100, max(1, RLIMIT_NOFILE / 7))`
///
/// Each in-flight target can hold several descriptors (socket, pipes, temp
/// files), so the soft limit is divided across them.
pub fn default_concurrency() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return MIN_CONCURRENCY;
    }
    let derived = usize::try_from(limit.rlim_cur / 7).unwrap_or(MAX_CONCURRENCY);
    derived.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}
