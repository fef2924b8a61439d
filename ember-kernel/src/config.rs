use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    pub http_port: u16,
    pub stats_interval_secs: u64,     // cadence de collecte (réf : 5s)
    pub node_check_interval_secs: u64,
    pub command_timeout_secs: u64,    // garde-fou écriture console (réf : 30s)
    pub data_dir: String,
    pub docker: DockerConf,
    pub operators: Vec<OperatorConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DockerConf {
    pub timeout_secs: u64,
    pub tls: Option<TlsConf>,
}

/// Certificats client pour les nodes en mode TLS (port 2376).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConf {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

/// Opérateur avec sa clé API et sa liste de serveurs autorisés.
/// `allowed_servers: None` = tous les serveurs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OperatorConf {
    pub name: String,
    pub key: String,
    pub allowed_servers: Option<Vec<String>>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            stats_interval_secs: 5,
            node_check_interval_secs: 60,
            command_timeout_secs: 30,
            data_dir: "./data".into(),
            docker: DockerConf { timeout_secs: 20, tls: None },
            operators: Vec::new(),
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("EMBER_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() { return KernelConfig::default(); }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[kernel] config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        eprintln!("[kernel] pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.stats_interval_secs, 5);
        assert_eq!(cfg.command_timeout_secs, 30);
        assert!(cfg.operators.is_empty());
        assert!(cfg.docker.tls.is_none());
    }

    #[test]
    fn parses_yaml_with_operators() {
        let yaml = r#"
http_port: 9090
stats_interval_secs: 10
node_check_interval_secs: 30
command_timeout_secs: 15
data_dir: "/tmp/ember"
docker:
  timeout_secs: 5
operators:
  - name: ops
    key: secret
    allowed_servers: ["srv-1"]
"#;
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.operators.len(), 1);
        assert_eq!(cfg.operators[0].allowed_servers.as_deref(), Some(&["srv-1".to_string()][..]));
    }
}
