use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ArchiveError, ArchiveResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub tangle_db_path: PathBuf,
    pub utxo_db_path: PathBuf,
    /// Network the dataset must belong to; mismatches abort the bootstrap.
    pub network_id: u64,
    pub network_name: String,
    pub rest_listen: SocketAddr,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub skip_health_check: bool,
}

fn default_max_page_size() -> usize {
    1_000
}

fn default_cache_capacity() -> usize {
    256
}

impl NodeConfig {
    pub fn load(path: &Path) -> ArchiveResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ArchiveError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ArchiveResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ArchiveError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tangle_db_path: PathBuf::from("./data/tangle"),
            utxo_db_path: PathBuf::from("./data/utxo"),
            network_id: 0,
            network_name: "chrysalis-mainnet".to_string(),
            rest_listen: "127.0.0.1:9092".parse().expect("valid socket addr"),
            max_page_size: default_max_page_size(),
            cache_capacity: default_cache_capacity(),
            skip_health_check: false,
        }
    }
}
