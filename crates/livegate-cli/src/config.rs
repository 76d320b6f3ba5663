use anyhow::{Context, Result};
use livegate_core::config::{MODEL_V1SE_FILE, MODEL_V2_FILE};
use livegate_core::DetectorConfig;
use std::path::{Path, PathBuf};

/// Load detector settings: an optional TOML file (`--config` or
/// `LIVEGATE_CONFIG`), then `LIVEGATE_*` environment overrides.
pub fn load(path: Option<&Path>) -> Result<DetectorConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("LIVEGATE_CONFIG").ok().map(PathBuf::from));

    let base = match &path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: DetectorConfig = toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        None => DetectorConfig::default(),
    };

    let config = apply_env(base, |key| std::env::var(key).ok());
    config.validate().context("invalid detector configuration")?;
    Ok(config)
}

/// Apply `LIVEGATE_*` overrides read through `lookup`.
pub fn apply_env(mut config: DetectorConfig, lookup: impl Fn(&str) -> Option<String>) -> DetectorConfig {
    if let Some(dir) = lookup("LIVEGATE_MODEL_DIR").map(PathBuf::from) {
        config.model_v2_path = dir.join(MODEL_V2_FILE).to_string_lossy().into_owned();
        config.model_v1se_path = dir.join(MODEL_V1SE_FILE).to_string_lossy().into_owned();
    }
    if let Some(path) = lookup("LIVEGATE_MODEL_V2_PATH") {
        config.model_v2_path = path;
    }
    if let Some(path) = lookup("LIVEGATE_MODEL_V1SE_PATH") {
        config.model_v1se_path = path;
    }

    config.threshold = env_f32(&lookup, "LIVEGATE_THRESHOLD", config.threshold);
    config.v2_weight = env_f32(&lookup, "LIVEGATE_V2_WEIGHT", config.v2_weight);
    config.v1se_weight = env_f32(&lookup, "LIVEGATE_V1SE_WEIGHT", config.v1se_weight);
    config.max_batch_size = env_usize(&lookup, "LIVEGATE_MAX_BATCH_SIZE", config.max_batch_size);
    config.cache_duration_secs = env_f32(&lookup, "LIVEGATE_CACHE_DURATION", config.cache_duration_secs);
    config.intra_threads = env_usize(&lookup, "LIVEGATE_INTRA_THREADS", config.intra_threads);
    config.enable_quality_gate = env_flag(&lookup, "LIVEGATE_QUALITY_GATE", config.enable_quality_gate);
    config.enable_temporal_analysis =
        env_flag(&lookup, "LIVEGATE_TEMPORAL_ANALYSIS", config.enable_temporal_analysis);
    config.enable_adaptive_threshold =
        env_flag(&lookup, "LIVEGATE_ADAPTIVE_THRESHOLD", config.enable_adaptive_threshold);

    config
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Any value other than "0" enables the flag.
fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = apply_env(DetectorConfig::default(), env(&[]));
        assert_eq!(config, DetectorConfig::default());
    }

    #[test]
    fn test_model_dir_sets_both_paths() {
        let config = apply_env(DetectorConfig::default(), env(&[("LIVEGATE_MODEL_DIR", "/opt/livegate")]));
        assert_eq!(config.model_v2_path, format!("/opt/livegate/{MODEL_V2_FILE}"));
        assert_eq!(config.model_v1se_path, format!("/opt/livegate/{MODEL_V1SE_FILE}"));
    }

    #[test]
    fn test_explicit_path_wins_over_dir() {
        let config = apply_env(
            DetectorConfig::default(),
            env(&[("LIVEGATE_MODEL_DIR", "/opt/a"), ("LIVEGATE_MODEL_V2_PATH", "/tmp/v2.onnx")]),
        );
        assert_eq!(config.model_v2_path, "/tmp/v2.onnx");
        assert!(config.model_v1se_path.starts_with("/opt/a"));
    }

    #[test]
    fn test_numeric_and_flag_overrides() {
        let config = apply_env(
            DetectorConfig::default(),
            env(&[
                ("LIVEGATE_THRESHOLD", "0.72"),
                ("LIVEGATE_MAX_BATCH_SIZE", "16"),
                ("LIVEGATE_CACHE_DURATION", "1.5"),
                ("LIVEGATE_TEMPORAL_ANALYSIS", "0"),
                ("LIVEGATE_QUALITY_GATE", "yes"),
            ]),
        );
        assert_eq!(config.threshold, 0.72);
        assert_eq!(config.max_batch_size, 16);
        assert_eq!(config.cache_duration_secs, 1.5);
        assert!(!config.enable_temporal_analysis);
        assert!(config.enable_quality_gate);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = apply_env(
            DetectorConfig::default(),
            env(&[("LIVEGATE_THRESHOLD", "high"), ("LIVEGATE_MAX_BATCH_SIZE", "-3")]),
        );
        assert_eq!(config.threshold, 0.65);
        assert_eq!(config.max_batch_size, 8);
    }

    #[test]
    fn test_load_reads_toml_file() {
        let path = std::env::temp_dir().join(format!("livegate-config-{}.toml", std::process::id()));
        std::fs::write(&path, "threshold = 0.5\n[threshold_clamp]\nmin = 0.3\n").unwrap();
        let config = load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.threshold_clamp.min, 0.3);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(load(Some(Path::new("/nonexistent/livegate.toml"))).is_err());
    }
}
