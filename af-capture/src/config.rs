use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Host-side settings shared by every capture.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_proxy_host")]
    pub http_proxy_host: String,

    #[serde(default = "default_proxy_port")]
    pub http_proxy_port: u16,

    #[serde(default = "default_non_proxy_hosts")]
    pub http_non_proxy_hosts: String,

    #[serde(default = "default_setproxy_exe")]
    pub setproxy_exe: PathBuf,

    #[serde(default = "default_setoption_exe")]
    pub setoption_exe: PathBuf,

    #[serde(default = "default_backup_eventlogs_script")]
    pub backup_eventlogs_script: PathBuf,

    /// Directory under a datastore mount where installers are downloaded.
    #[serde(default = "default_installers_dir")]
    pub installers_dir: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_login_echo_attempts")]
    pub login_echo_attempts: u32,

    #[serde(default = "default_login_echo_interval_ms")]
    pub login_echo_interval_ms: u64,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn default_proxy_host() -> String {
    env_or("AF_HTTP_PROXY_HOST", "")
}

fn default_proxy_port() -> u16 {
    env_parsed("AF_HTTP_PROXY_PORT", 0)
}

fn default_non_proxy_hosts() -> String {
    env_or("AF_HTTP_NON_PROXY_HOSTS", "")
}

fn default_setproxy_exe() -> PathBuf {
    PathBuf::from(env_or("AF_SETPROXY_EXE", "tools/setproxy.exe"))
}

fn default_setoption_exe() -> PathBuf {
    PathBuf::from(env_or("AF_SETOPTION_EXE", "tools/setoption.exe"))
}

fn default_backup_eventlogs_script() -> PathBuf {
    PathBuf::from(env_or("AF_BACKUP_EVENTLOGS_SCRIPT", "tools/backupeventlogs.vbs"))
}

fn default_installers_dir() -> String {
    env_or("AF_INSTALLERS_DIR", "installers/")
}

fn default_poll_interval_ms() -> u64 {
    env_parsed("AF_CAPTURE_POLL_INTERVAL_MS", 1000)
}

fn default_login_echo_attempts() -> u32 {
    env_parsed("AF_LOGIN_ECHO_ATTEMPTS", 15)
}

fn default_login_echo_interval_ms() -> u64 {
    env_parsed("AF_LOGIN_ECHO_INTERVAL_MS", 10_000)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            http_proxy_host: default_proxy_host(),
            http_proxy_port: default_proxy_port(),
            http_non_proxy_hosts: default_non_proxy_hosts(),
            setproxy_exe: default_setproxy_exe(),
            setoption_exe: default_setoption_exe(),
            backup_eventlogs_script: default_backup_eventlogs_script(),
            installers_dir: default_installers_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            login_echo_attempts: default_login_echo_attempts(),
            login_echo_interval_ms: default_login_echo_interval_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn login_echo_interval(&self) -> Duration {
        Duration::from_millis(self.login_echo_interval_ms)
    }

    /// The guest proxy is only configured with both a host and a port.
    pub fn has_proxy(&self) -> bool {
        !self.http_proxy_host.is_empty() && self.http_proxy_port > 0
    }
}
