//! Archiver configuration: a TOML file with sections for the archiver
//! itself, the messaging fabric, the metadata backend, and the timeseries
//! engine, plus container-style environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not parse duration {0:?}")]
    BadDuration(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSection {
    /// Permission-cache TTL, e.g. `30s`, `10m`, `1h`.
    #[serde(rename = "BlockExpiry")]
    pub block_expiry: String,
    /// Emit the counter log line every 10 seconds.
    #[serde(rename = "PeriodicReport")]
    pub periodic_report: bool,
    /// Path of the embedded prefix-index file.
    #[serde(rename = "PrefixDB")]
    pub prefix_db: String,
}

impl Default for ArchiverSection {
    fn default() -> Self {
        ArchiverSection {
            block_expiry: "10m".to_owned(),
            periodic_report: true,
            prefix_db: "granary-prefix.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BosswaveSection {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Entityfile")]
    pub entityfile: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "DeployNS")]
    pub deploy_ns: String,
    /// Namespaces whose wildcard subscriptions feed the view manager.
    #[serde(rename = "ListenNS")]
    pub listen_ns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSection {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "CollectionPrefix")]
    pub collection_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrdbSection {
    #[serde(rename = "Address")]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Archiver")]
    pub archiver: ArchiverSection,
    #[serde(rename = "BOSSWAVE")]
    pub bosswave: BosswaveSection,
    #[serde(rename = "Metadata")]
    pub metadata: MetadataSection,
    #[serde(rename = "BtrDB")]
    pub btrdb: BtrdbSection,
}

impl Config {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Container-style environment overrides.
    pub fn apply_env(&mut self) {
        let mut set = |name: &str, slot: &mut String| {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        };
        set("BTRDB_SERVER", &mut self.btrdb.address);
        set("MONGO_SERVER", &mut self.metadata.address);
        set("GILES_BW_ENTITY", &mut self.bosswave.entityfile);
        set("GILES_BW_NAMESPACE", &mut self.bosswave.namespace);
        set("GILES_BW_ADDRESS", &mut self.bosswave.address);
        set("COLLECTION_PREFIX", &mut self.metadata.collection_prefix);
        if let Ok(value) = std::env::var("GILES_BW_LISTEN") {
            if !value.is_empty() {
                self.bosswave.listen_ns =
                    value.split(',').map(|s| s.trim().to_owned()).collect();
            }
        }
    }

    /// The permission-cache TTL.
    pub fn block_expiry(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.archiver.block_expiry)
    }

    /// A commented default config, written by `mkconfig`.
    pub fn default_toml() -> String {
        concat!(
            "[Archiver]\n",
            "BlockExpiry = \"10m\"\n",
            "PeriodicReport = true\n",
            "PrefixDB = \"granary-prefix.db\"\n",
            "\n",
            "[BOSSWAVE]\n",
            "Address = \"0.0.0.0:28589\"\n",
            "Entityfile = \"myentity.ent\"\n",
            "Namespace = \"scratch.ns\"\n",
            "DeployNS = \"scratch.ns\"\n",
            "ListenNS = [\"scratch.ns\"]\n",
            "\n",
            "[Metadata]\n",
            "Address = \"0.0.0.0:27017\"\n",
            "CollectionPrefix = \"\"\n",
            "\n",
            "[BtrDB]\n",
            "Address = \"0.0.0.0:4410\"\n",
        )
        .to_owned()
    }
}

/// Parse durations of the form `300ms`, `30s`, `10m`, `1h`. A bare number
/// is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::BadDuration(raw.to_owned()))?;
    match suffix {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::BadDuration(raw.to_owned())),
    }
}
