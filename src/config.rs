//! Decoder configuration.
//!
//! All tunables of the lattice decoder live in [`DecoderConfig`]. Defaults match
//! production values for large-vocabulary decoding; tests and embedders override
//! the capacities to fit their graphs. Configuration can be assembled from a
//! TOML file and environment variables with the same precedence scheme used
//! across the stack: defaults, then `latgen.toml`, then `LATGEN_*` variables.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_gpu_fraction() -> f32 {
    1.0 / 8.0
}
fn default_lat_fraction() -> f32 {
    1.0 / 2.0
}
fn default_max_tokens_per_frame() -> u32 {
    200_000
}
fn default_max_lat_arc_per_frame() -> u32 {
    600_000
}
fn default_max_tokens() -> u32 {
    6_000_000
}
fn default_max_arcs() -> u32 {
    9_000_000
}
fn default_lattice_beam() -> f32 {
    10.0
}
fn default_beam() -> f32 {
    16.0
}
fn default_prune_interval() -> u32 {
    3000
}
fn default_determinize_lattice() -> bool {
    true
}

/// Tunables for the lattice decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Decoding beam. Larger is slower and more accurate.
    #[serde(default = "default_beam")]
    pub beam: f32,

    /// Lattice generation beam. Larger keeps denser lattices.
    #[serde(default = "default_lattice_beam")]
    pub lattice_beam: f32,

    /// Fraction of the machine's parallelism given to this decoder's grid.
    /// A single decoding cannot saturate the device; run several decoders
    /// in parallel for best throughput.
    #[serde(default = "default_gpu_fraction")]
    pub gpu_fraction: f32,

    /// Fraction of the grid given to lattice processing.
    #[serde(default = "default_lat_fraction")]
    pub lat_fraction: f32,

    /// Maximum tokens admitted in a single frame. Exceeding this is
    /// undefined behavior by contract; the caller sizes the arenas.
    #[serde(default = "default_max_tokens_per_frame")]
    pub max_tokens_per_frame: u32,

    /// Maximum lattice arcs produced in a single frame. Same contract as
    /// `max_tokens_per_frame`.
    #[serde(default = "default_max_lat_arc_per_frame")]
    pub max_lat_arc_per_frame: u32,

    /// Total token arena capacity for an entire utterance.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Total lattice-arc arena capacity for an entire utterance.
    #[serde(default = "default_max_arcs")]
    pub max_arcs: u32,

    /// Interval in frames at which the backward pruning pass runs.
    #[serde(default = "default_prune_interval")]
    pub prune_interval: u32,

    /// If true, the caller should determinize the lattice after finalize.
    /// Determinization itself is performed by the lattice sink.
    #[serde(default = "default_determinize_lattice")]
    pub determinize_lattice: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam: default_beam(),
            lattice_beam: default_lattice_beam(),
            gpu_fraction: default_gpu_fraction(),
            lat_fraction: default_lat_fraction(),
            max_tokens_per_frame: default_max_tokens_per_frame(),
            max_lat_arc_per_frame: default_max_lat_arc_per_frame(),
            max_tokens: default_max_tokens(),
            max_arcs: default_max_arcs(),
            prune_interval: default_prune_interval(),
            determinize_lattice: default_determinize_lattice(),
        }
    }
}

impl DecoderConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed with `LATGEN_` (highest priority)
    /// 2. `latgen.toml` (if it exists)
    /// 3. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        let config: DecoderConfig = Figment::from(Serialized::defaults(DecoderConfig::default()))
            .merge(Toml::file("latgen.toml"))
            .merge(Env::prefixed("LATGEN_"))
            .extract()
            .map_err(|e| Error::Configuration(format!("failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants the decoder relies on.
    pub fn validate(&self) -> Result<()> {
        if !(self.beam > 0.0) {
            return Err(Error::Configuration(format!(
                "beam must be positive, got {}",
                self.beam
            )));
        }
        if !(self.lattice_beam > 0.0) {
            return Err(Error::Configuration(format!(
                "lattice_beam must be positive, got {}",
                self.lattice_beam
            )));
        }
        if !(self.gpu_fraction > 0.0 && self.gpu_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "gpu_fraction must be in (0, 1], got {}",
                self.gpu_fraction
            )));
        }
        if !(self.lat_fraction > 0.0 && self.lat_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "lat_fraction must be in (0, 1], got {}",
                self.lat_fraction
            )));
        }
        if self.max_tokens_per_frame == 0 || self.max_tokens == 0 {
            return Err(Error::Configuration(
                "token arena capacities must be positive".to_string(),
            ));
        }
        if self.max_lat_arc_per_frame == 0 || self.max_arcs == 0 {
            return Err(Error::Configuration(
                "arc arena capacities must be positive".to_string(),
            ));
        }
        if self.prune_interval == 0 {
            return Err(Error::Configuration(
                "prune_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of worker threads the token-passing grid runs with.
    pub(crate) fn grid_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ((cores as f32 * self.gpu_fraction).round() as usize).clamp(1, cores)
    }

    /// Number of worker threads the lattice pruner runs with.
    pub(crate) fn lat_threads(&self) -> usize {
        let grid = self.grid_threads();
        ((grid as f32 * self.lat_fraction).round() as usize).clamp(1, grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prune_interval, 3000);
        assert!((config.beam - 16.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_beam_rejected() {
        let config = DecoderConfig {
            beam: 0.0,
            ..DecoderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let config = DecoderConfig {
            gpu_fraction: 1.5,
            ..DecoderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_counts_at_least_one() {
        let config = DecoderConfig {
            gpu_fraction: 0.001,
            lat_fraction: 0.001,
            ..DecoderConfig::default()
        };
        assert!(config.grid_threads() >= 1);
        assert!(config.lat_threads() >= 1);
    }
}
