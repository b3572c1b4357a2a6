use af_workpool::model::VmLocation;
use af_workpool::VcConfig;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Simulator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_vc")]
    pub vc: VcConfig,

    #[serde(default = "default_guest_password")]
    pub guest_password: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("AF_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("appfactory").join("workpool.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".appfactory").join("workpool.db")
    }
}

fn default_max_concurrent_operations() -> usize {
    std::env::var("AF_MAX_CONCURRENT_OPERATIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&n: &usize| n > 0)
        .unwrap_or(4)
}

fn default_backend() -> String {
    env_or("AF_BACKEND", "simulator")
}

fn default_vc() -> VcConfig {
    VcConfig {
        host: env_or("AF_VC_HOST", "localhost"),
        datacenter: env_or("AF_VC_DATACENTER", ""),
        username: env_or("AF_VC_USERNAME", ""),
        password: env_or("AF_VC_PASSWORD", ""),
        vm_location: VmLocation {
            compute_resource: env_or("AF_VC_COMPUTE_RESOURCE", ""),
            datastore_name: env_or("AF_VC_DATASTORE", ""),
            resource_pool: env_or("AF_VC_RESOURCE_POOL", ""),
        },
    }
}

fn default_guest_password() -> String {
    env_or("AF_GUEST_PASSWORD", "")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_concurrent_operations: default_max_concurrent_operations(),
            backend: default_backend(),
            vc: default_vc(),
            guest_password: default_guest_password(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn backend_kind(&self) -> anyhow::Result<BackendKind> {
        match self.backend.trim().to_ascii_lowercase().as_str() {
            "simulator" => Ok(BackendKind::Simulator),
            other => anyhow::bail!("Unknown backend '{}'", other),
        }
    }
}
