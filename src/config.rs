use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::get_data_dir;

/// Complete application configuration: where each backend keeps its
/// document and which systemd unit fronts it. Defaults match the stock
/// install paths; overrides come from `config.json` in the data dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_gost_unit_path")]
    pub gost_unit_path: PathBuf,
    #[serde(default = "default_gost_unit_name")]
    pub gost_unit_name: String,
    #[serde(default = "default_haproxy_config_path")]
    pub haproxy_config_path: PathBuf,
    #[serde(default = "default_haproxy_unit_name")]
    pub haproxy_unit_name: String,
    #[serde(default = "default_xray_config_path")]
    pub xray_config_path: PathBuf,
    #[serde(default = "default_xray_unit_name")]
    pub xray_unit_name: String,
    #[serde(default = "default_iptables_rules_path")]
    pub iptables_rules_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gost_unit_path: default_gost_unit_path(),
            gost_unit_name: default_gost_unit_name(),
            haproxy_config_path: default_haproxy_config_path(),
            haproxy_unit_name: default_haproxy_unit_name(),
            xray_config_path: default_xray_config_path(),
            xray_unit_name: default_xray_unit_name(),
            iptables_rules_path: default_iptables_rules_path(),
        }
    }
}

fn default_gost_unit_path() -> PathBuf {
    PathBuf::from("/usr/lib/systemd/system/gost.service")
}

fn default_gost_unit_name() -> String {
    "gost".to_string()
}

fn default_haproxy_config_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_haproxy_unit_name() -> String {
    "haproxy".to_string()
}

fn default_xray_config_path() -> PathBuf {
    PathBuf::from("/usr/local/etc/xray/config.json")
}

fn default_xray_unit_name() -> String {
    "xray".to_string()
}

fn default_iptables_rules_path() -> PathBuf {
    PathBuf::from("/etc/iptables/rules.v4")
}

/// Saves the app config to its place in the data dir.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        write_config(&path, config).await?;
    }
    Ok(())
}

/// Atomic write pattern: temp file with 0o600 permissions, then rename.
async fn write_config(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.to_path_buf();
    temp_path.set_extension("json.tmp");

    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await
}

/// Loads the app config from disk. A missing file is materialized with
/// defaults so operators have something to edit; an unreadable or invalid
/// one falls back to defaults without overwriting it.
pub async fn load_config() -> AppConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                if let Ok(config) = serde_json::from_str::<AppConfig>(&json) {
                    return config;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                if let Err(e) = save_config(&config).await {
                    tracing::debug!("could not write default config: {e}");
                }
                return config;
            }
            Err(_) => {}
        }
    }
    AppConfig::default()
}
