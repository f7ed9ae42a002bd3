use std::path::PathBuf;
use std::time::Duration;

/// Process settings, read from `TIMELINE_*` environment variables.
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Persist documents in a journal under `data_dir`; otherwise memory only.
    pub journal: bool,
    pub metrics_port: Option<u16>,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    /// Period of the full re-validation sweep; `None` disables it.
    pub revalidate_interval: Option<Duration>,
    pub revalidate_concurrency: usize,
    pub revalidate_on_delete: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal: true,
            metrics_port: None,
            compact_threshold: 1000,
            revalidate_interval: None,
            revalidate_concurrency: 8,
            revalidate_on_delete: true,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let revalidate_secs: u64 = var("TIMELINE_REVALIDATE_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Self {
            data_dir: var("TIMELINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            journal: var("TIMELINE_JOURNAL")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.journal),
            metrics_port: var("TIMELINE_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: var("TIMELINE_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            revalidate_interval: (revalidate_secs > 0).then(|| Duration::from_secs(revalidate_secs)),
            revalidate_concurrency: var("TIMELINE_REVALIDATE_CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.revalidate_concurrency),
            revalidate_on_delete: var("TIMELINE_REVALIDATE_ON_DELETE")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.revalidate_on_delete),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("timeline.journal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from(&[]), Config::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = from(&[
            ("TIMELINE_DATA_DIR", "/var/lib/timeline"),
            ("TIMELINE_JOURNAL", "off"),
            ("TIMELINE_METRICS_PORT", "9100"),
            ("TIMELINE_COMPACT_THRESHOLD", "50"),
            ("TIMELINE_REVALIDATE_SECS", "300"),
            ("TIMELINE_REVALIDATE_CONCURRENCY", "2"),
            ("TIMELINE_REVALIDATE_ON_DELETE", "false"),
        ]);
        assert_eq!(config.journal_path(), PathBuf::from("/var/lib/timeline/timeline.journal"));
        assert!(!config.journal);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.revalidate_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.revalidate_concurrency, 2);
        assert!(!config.revalidate_on_delete);
    }

    #[test]
    fn garbage_falls_back() {
        let config = from(&[
            ("TIMELINE_METRICS_PORT", "http"),
            ("TIMELINE_COMPACT_THRESHOLD", "-1"),
            ("TIMELINE_REVALIDATE_CONCURRENCY", "0"),
            ("TIMELINE_JOURNAL", "maybe"),
        ]);
        assert_eq!(config, Config::default());
    }
}
