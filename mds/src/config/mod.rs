use balancer::{BalancerConfig, OpType};
use dirtree::Rank;
use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utilities::result::Result;

fn default_op() -> OpType {
    OpType::Read
}

/// One directory of the namespace every rank starts with.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DirLayout {
    pub path: String,
    /// Rank serving the directory, inherited from the parent when unset.
    #[serde(default)]
    pub authority: Option<Rank>,
    #[serde(default)]
    pub export_pin: Option<Rank>,
    #[serde(default)]
    pub entries: usize,
}

/// Synthetic load put on a directory while the rank serves it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HotPath {
    pub path: String,
    #[serde(default = "default_op")]
    pub op: OpType,
    /// Hits per second.
    pub rate: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub rank: Rank,
    pub listen_addr: String,
    /// Peer addresses indexed by rank, this rank included.
    pub peers: Vec<String>,
    pub log_level: String,
    pub log_base: String,
    pub apm_endpoint: Option<String>,
    pub state_log_file: Option<String>,
    pub tick_ms: u64,
    pub send_retries: u8,
    pub send_backoff_ms: u64,
    /// Queued exports carried out per tick.
    pub exports_per_tick: usize,
    pub root_authority: Rank,
    pub namespace: Vec<DirLayout>,
    pub workload: Vec<HotPath>,
    pub balancer: BalancerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rank: 0,
            listen_addr: "127.0.0.1:6800".to_string(),
            peers: vec!["127.0.0.1:6800".to_string()],
            log_level: "info".to_string(),
            log_base: "./temp/mds/".to_string(),
            apm_endpoint: None,
            state_log_file: Some("./temp/mds/loads.log".to_string()),
            tick_ms: 1000,
            send_retries: 3,
            send_backoff_ms: 200,
            exports_per_tick: 4,
            root_authority: 0,
            namespace: Vec::new(),
            workload: Vec::new(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl Config {
    pub fn figment(config_file_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_file_path))
    }
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
    pub fn send_backoff(&self) -> Duration {
        Duration::from_millis(self.send_backoff_ms)
    }
    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    pub fn validate(&self) -> Result<()> {
        let size = self.cluster_size();
        if self.rank as usize >= size {
            return Err(format!("rank {} has no entry in the {size} peers", self.rank).into());
        }
        if self.root_authority as usize >= size {
            return Err(format!("root authority {} is not a known rank", self.root_authority).into());
        }
        if let Some(dir) = self.namespace.iter().find(|dir| {
            dir.authority.is_some_and(|rank| rank as usize >= size) || !dir.path.starts_with('/')
        }) {
            return Err(format!("invalid namespace entry {:?}", dir.path).into());
        }
        self.balancer.validate()?;
        Ok(())
    }
}

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    let env = std::env::var("ENV").unwrap_or_else(|_| "default".to_owned());
    let config_file_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| format!("./mds/config/{}.yaml", env));
    Config::figment(&config_file_path)
        .extract()
        .unwrap_or_else(|e| panic!("Error while reading config from {config_file_path}: {e}"))
});

#[cfg(test)]
mod tests {
    use super::*;
    use balancer::Strategy;

    fn from_yaml(yaml: &str) -> Config {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap()
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config = from_yaml(
            r#"
rank: 1
peers: ["127.0.0.1:6800", "127.0.0.1:6801"]
namespace:
  - path: /home
    authority: 1
  - path: /home/alice
    export_pin: 0
workload:
  - path: /home/alice
    op: write
    rate: 40
balancer:
  strategy: imbalance_factor
  interval_secs: 5
"#,
        );
        assert_eq!(config.rank, 1);
        assert_eq!(config.cluster_size(), 2);
        assert_eq!(config.namespace[0].authority, Some(1));
        assert_eq!(config.namespace[1].export_pin, Some(0));
        assert_eq!(config.workload[0].op, OpType::Write);
        assert_eq!(config.balancer.strategy, Strategy::ImbalanceFactor);
        assert_eq!(config.balancer.interval_secs, 5);
        // untouched balancer options keep their defaults
        assert_eq!(config.balancer.need_min, BalancerConfig::default().need_min);
        assert_eq!(config.tick_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rank_outside_peer_list_is_rejected() {
        let config = from_yaml("rank: 3\npeers: [\"127.0.0.1:6800\"]\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_namespace_path_is_rejected() {
        let config = from_yaml("namespace:\n  - path: home\n");
        assert!(config.validate().is_err());
    }
}
