//! Tuning knobs for the protocol core.
//!
//! The reconciliation epsilon and delta-history depth were empirically
//! tuned constants in engines of this lineage; they depend on tick rate and
//! movement speed, so they are configuration here rather than hard-coded.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Protocol tuning values, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Divergence between predicted and authoritative origin, in world
    /// units, beyond which the client snaps and replays. One coordinate
    /// quantum by default; anything tighter replays on quantization noise.
    pub prediction_epsilon: f32,

    /// Oldest acknowledged frame (in frames behind the current one) the
    /// server will still delta against; older clients get uncompressed
    /// frames. Must leave headroom below the history ring depth.
    pub max_delta_age: u32,

    /// Milliseconds without any packet before a peer is presumed gone.
    pub connection_timeout_ms: u64,

    /// Milliseconds between handshake retransmissions (challenge and
    /// connect requests).
    pub handshake_retry_ms: u64,

    /// Client slots the server allocates.
    pub max_clients: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            prediction_epsilon: 0.125,
            max_delta_age: 13,
            connection_timeout_ms: 30_000,
            handshake_retry_ms: 3_000,
            max_clients: crate::protocol::MAX_CLIENTS,
        }
    }
}

impl NetConfig {
    /// Load from a TOML file, falling back to defaults on any error.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<NetConfig>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    NetConfig::default()
                }
            },
            Err(err) => {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
                NetConfig::default()
            }
        }
    }
}
