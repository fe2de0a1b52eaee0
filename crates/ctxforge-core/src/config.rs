//! Compaction configuration and its context-window-aware adaptation.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Immutable per-session compaction configuration.
///
/// Unknown fields encountered while loading are ignored (figment's default
/// behavior with `#[serde(default)]` on every field).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub max_context_tokens: u32,
    pub trigger_threshold: f32,
    pub reserve_tokens: u32,
    pub keep_recent_count: usize,
    pub max_message_count: usize,
    pub summary_max_tokens: u32,
    pub chunk_max_tokens: u32,
    pub adaptive_chunk_min_ratio: f32,
    pub adaptive_chunk_max_ratio: f32,
    pub max_single_msg_ratio: f32,
    pub compacted_tool_result_max_bytes: usize,
    pub tool_result_max_bytes: usize,
    pub max_request_bytes: usize,
    /// Context window used as the baseline for `for_model` rescaling.
    pub baseline_context_window: u32,
    /// Whether the caller should be signaled to inject a memory-flush turn
    /// ahead of the hard compaction trigger (`needs_memory_flush`).
    pub memory_flush_enabled: bool,
    /// Tokens of headroom below `token_threshold` at which
    /// `needs_memory_flush` fires, giving the caller a chance to save
    /// important state before compaction becomes mandatory.
    pub soft_threshold_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 48_000,
            trigger_threshold: 0.8,
            reserve_tokens: 10_000,
            keep_recent_count: 10,
            max_message_count: 40,
            summary_max_tokens: 1_000,
            chunk_max_tokens: 64_000,
            adaptive_chunk_min_ratio: 0.15,
            adaptive_chunk_max_ratio: 0.40,
            max_single_msg_ratio: 0.5,
            compacted_tool_result_max_bytes: 4_096,
            tool_result_max_bytes: 65_536,
            max_request_bytes: 65_536,
            baseline_context_window: 48_000,
            memory_flush_enabled: false,
            soft_threshold_tokens: 2_000,
        }
    }
}

impl CompactionConfig {
    /// Derived token trigger: `max_context_tokens - reserve_tokens` when the
    /// reserve is meaningfully set, else the legacy fractional threshold.
    pub fn token_threshold(&self) -> u32 {
        if self.reserve_tokens > 0 && self.reserve_tokens < self.max_context_tokens {
            self.max_context_tokens - self.reserve_tokens
        } else {
            (self.max_context_tokens as f32 * self.trigger_threshold) as u32
        }
    }

    /// Rescale token and byte budgets proportionally to a model's reported
    /// context window, with super-linear (x2.5 on top of linear) scaling for
    /// `max_message_count`.
    pub fn for_model(&self, model_context_window: u32) -> Self {
        if self.baseline_context_window == 0 {
            return self.clone();
        }
        let scale = model_context_window as f32 / self.baseline_context_window as f32;
        let mut cfg = self.clone();
        cfg.max_context_tokens = (self.max_context_tokens as f32 * scale) as u32;
        cfg.reserve_tokens = (self.reserve_tokens as f32 * scale) as u32;
        cfg.chunk_max_tokens = (self.chunk_max_tokens as f32 * scale) as u32;
        cfg.max_request_bytes = (self.max_request_bytes as f32 * scale) as usize;
        cfg.tool_result_max_bytes = (self.tool_result_max_bytes as f32 * scale) as usize;
        cfg.max_message_count = (self.max_message_count as f32 * scale * 2.5) as usize;
        cfg.baseline_context_window = model_context_window;
        cfg
    }
}

/// Top-level engine configuration, loaded via figment layering (defaults →
/// user config → project config → `CTXFORGE_`-prefixed env vars).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub compaction: CompactionConfig,
}

impl EngineConfig {
    pub fn load() -> Result<Self, figment::Error> {
        let config_dir = Self::config_dir();

        Figment::new()
            .merge(figment::providers::Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(config_dir.join("config.toml")))
            .merge(Toml::file(".ctxforge/config.toml"))
            .merge(Env::prefixed("CTXFORGE_").split("__"))
            .extract()
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("ctxforge"))
            .unwrap_or_else(|| PathBuf::from("~/.config/ctxforge"))
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("ctxforge"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/ctxforge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_threshold_uses_reserve_when_set() {
        let cfg = CompactionConfig::default();
        assert_eq!(cfg.token_threshold(), 48_000 - 10_000);
    }

    #[test]
    fn token_threshold_falls_back_to_fraction() {
        let mut cfg = CompactionConfig::default();
        cfg.reserve_tokens = 0;
        assert_eq!(cfg.token_threshold(), (48_000.0 * 0.8) as u32);
    }

    #[test]
    fn for_model_scales_linearly_and_message_count_super_linearly() {
        let cfg = CompactionConfig::default();
        let scaled = cfg.for_model(200_000);
        // 200_000 / 48_000 ~= 4.1667
        assert!(scaled.max_context_tokens > cfg.max_context_tokens * 4);
        let linear_scale = 200_000.0 / 48_000.0;
        let expected_msg_count = (cfg.max_message_count as f32 * linear_scale * 2.5) as usize;
        assert_eq!(scaled.max_message_count, expected_msg_count);
    }
}
