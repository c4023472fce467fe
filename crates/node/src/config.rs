use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

use mesh_radisk::RadiskOptions;

pub const CONFIG_FILE: &str = "mesh.toml";

/// Everything a mesh instance can be tuned with. Field names follow the
/// wire-era option vocabulary (`file`, `size`, `batch`, `write`, ...).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct MeshConfig {
    /// Directory holding the radix store files.
    pub file: Utf8PathBuf,

    /// Max bytes per store file before slicing.
    #[serde(default = "defaults::size")]
    pub size: usize,

    /// Store batch byte threshold that forces an early flush.
    #[serde(default = "defaults::batch")]
    pub batch: usize,

    /// Idle interval between store flushes.
    #[serde(default = "defaults::write", rename = "write_ms", with = "serde_duration")]
    pub write: Duration,

    /// Keep decoded store files in memory.
    #[serde(default = "defaults::cache")]
    pub cache: bool,

    /// Seen-message retention.
    #[serde(default = "defaults::max_age", rename = "max_age_ms", with = "serde_duration")]
    pub max_age: Duration,

    /// Outbound queue cap.
    #[serde(default = "defaults::max_queue_length")]
    pub max_queue_length: usize,

    /// Reject writes to unsigned public souls and serve only verifiable
    /// data for user-owned ones.
    #[serde(default)]
    pub secure: bool,

    /// Default GET timeout; also the deferred-retry scheduling grain.
    #[serde(default = "defaults::wait", rename = "wait_ms", with = "serde_duration")]
    pub wait: Duration,

    /// Inbound frame size cap.
    #[serde(default = "defaults::max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Soul cap for the in-memory graph.
    #[serde(default = "defaults::max_graph")]
    pub max_graph: usize,

    /// Upstream peer addresses, handed to whatever transport is injected.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Disables the background rate-limit cleanup sweep so time-paused
    /// tests stay deterministic.
    #[serde(default)]
    pub test_env: bool,
}

mod defaults {
    use core::time::Duration;

    pub const fn size() -> usize {
        1024 * 1024
    }

    pub const fn batch() -> usize {
        10 * 1024
    }

    pub const fn write() -> Duration {
        Duration::from_millis(1)
    }

    pub const fn cache() -> bool {
        true
    }

    pub const fn max_age() -> Duration {
        Duration::from_secs(9)
    }

    pub const fn max_queue_length() -> usize {
        1000
    }

    pub const fn wait() -> Duration {
        Duration::from_millis(100)
    }

    pub const fn max_frame_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub const fn max_graph() -> usize {
        mesh_ham::MAX_GRAPH_SIZE
    }
}

impl MeshConfig {
    #[must_use]
    pub fn new(file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            file: file.into(),
            size: defaults::size(),
            batch: defaults::batch(),
            write: defaults::write(),
            cache: defaults::cache(),
            max_age: defaults::max_age(),
            max_queue_length: defaults::max_queue_length(),
            secure: false,
            wait: defaults::wait(),
            max_frame_bytes: defaults::max_frame_bytes(),
            max_graph: defaults::max_graph(),
            peers: Vec::new(),
            test_env: false,
        }
    }

    /// The store options this configuration implies.
    #[must_use]
    pub fn radisk_options(&self) -> RadiskOptions {
        let mut opts = RadiskOptions::new(self.file.clone());
        opts.size = self.size;
        opts.batch = self.batch;
        opts.write = self.write;
        opts.cache = self.cache;
        opts
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
