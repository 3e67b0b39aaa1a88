use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{LivetapError, Result};

/// Band name mapped to an inclusive `[low, high]` frequency range in Hz.
pub type BandMap = BTreeMap<String, [f32; 2]>;

/// Top-level configuration consumed by the topology builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub tasks: TaskFlags,
    pub channels: usize,
    pub sampling_rate: u32,
    pub pitch_algorithm: String,
    pub bands: BandMap,
    /// Samples per channel in every buffer handed to the root node.
    pub frames_per_buffer: usize,
    /// Average every input channel into a single analysed channel.
    pub merge_channels: bool,
    pub queue: QueueSettings,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tasks: TaskFlags::default(),
            channels: 1,
            sampling_rate: 44_100,
            pitch_algorithm: "auto-correlation".to_string(),
            bands: default_bands(),
            frames_per_buffer: 1024,
            merge_channels: false,
            queue: QueueSettings::default(),
        }
    }
}

impl AnalysisConfig {
    /// Reads and validates a JSON configuration document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(?path, "loaded analysis configuration");
        Ok(config)
    }

    /// Parses and validates a JSON configuration document. Missing keys fall
    /// back to their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// Channel count and task selection are reported by the topology
    /// builder instead.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            return Err(LivetapError::config("sampling_rate must be positive"));
        }
        if self.frames_per_buffer == 0 {
            return Err(LivetapError::config("frames_per_buffer must be positive"));
        }
        if self.queue.capacity == 0 {
            return Err(LivetapError::config("queue capacity must be positive"));
        }
        for (name, [low, high]) in &self.bands {
            if !(low < high) || *low < 0.0 {
                return Err(LivetapError::config(format!(
                    "band `{name}` has an invalid range [{low}, {high}]"
                )));
            }
        }
        Ok(())
    }

    /// Number of independent sub-trees the builder will assemble.
    pub fn analysed_channels(&self) -> usize {
        if self.merge_channels {
            self.channels.min(1)
        } else {
            self.channels
        }
    }
}

/// Which analysis tasks are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFlags {
    pub beat: bool,
    pub pitch: bool,
    pub genre: bool,
    pub bands: bool,
}

impl Default for TaskFlags {
    fn default() -> Self {
        Self {
            beat: true,
            pitch: true,
            genre: false,
            bands: true,
        }
    }
}

impl TaskFlags {
    /// Flags with every task disabled.
    pub fn none() -> Self {
        Self {
            beat: false,
            pitch: false,
            genre: false,
            bands: false,
        }
    }
}

/// What a producer does when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Evict the oldest queued packet to make room. Keeps latency bounded for
    /// a fixed-rate source at the cost of losing data.
    DropOldest,
    /// Block [`Pipeline::push`](crate::Pipeline::push) until the root catches
    /// up. Queues below the root still drop their oldest packet, so a stalled
    /// worker never holds up its siblings.
    Block,
}

/// Sizing and overflow policy shared by every node queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub policy: Backpressure,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 32,
            policy: Backpressure::DropOldest,
        }
    }
}

/// The seven conventional mixing bands.
pub fn default_bands() -> BandMap {
    [
        ("sub-bass", [20.0, 60.0]),
        ("bass", [60.0, 250.0]),
        ("low-mid", [250.0, 500.0]),
        ("mid", [500.0, 2_000.0]),
        ("upper-mid", [2_000.0, 4_000.0]),
        ("presence", [4_000.0, 6_000.0]),
        ("brilliance", [6_000.0, 20_000.0]),
    ]
    .into_iter()
    .map(|(name, range)| (name.to_string(), range))
    .collect()
}
