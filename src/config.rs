//! Configuration types for the scan detection agent.

use crate::policy::TrustedEntry;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Legacy environment variable that overrides `detection.threshold`.
///
/// Any finite number is accepted: fractions truncate and negative values
/// clamp to 0, which blocks on the first not-found.
pub const THRESHOLD_ENV: &str = "SCAN_DETECT_404_FOUND_TIME";

/// Root configuration for the scan detection agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Counting and blocking parameters.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Client IP extraction.
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    /// In-process store sizing.
    #[serde(default)]
    pub store: StoreConfig,

    /// Identifiers that are never counted or blocked.
    #[serde(default = "default_trusted")]
    pub trusted: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            detection: DetectionConfig::default(),
            ip_extraction: IpExtractionConfig::default(),
            store: StoreConfig::default(),
            trusted: default_trusted(),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log rejected requests and newly created blocks.
    #[serde(default = "default_true")]
    pub log_blocked: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_blocked: true,
        }
    }
}

/// Counting and blocking parameters.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DetectionConfig {
    /// Block once the not-found count within the window exceeds this value.
    #[serde(
        default = "default_threshold",
        deserialize_with = "deserialize_threshold"
    )]
    pub threshold: u64,

    /// Counter lifetime, refreshed on every recorded attempt.
    #[serde(default = "default_count_window")]
    pub count_window_seconds: u64,

    /// How long a block lasts.
    #[serde(default = "default_block_duration")]
    pub block_duration_seconds: u64,
}

impl DetectionConfig {
    pub fn count_window(&self) -> Duration {
        Duration::from_secs(self.count_window_seconds)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_seconds)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            count_window_seconds: default_count_window(),
            block_duration_seconds: default_block_duration(),
        }
    }
}

fn default_threshold() -> u64 {
    20
}

fn default_count_window() -> u64 {
    60
}

fn default_block_duration() -> u64 {
    300
}

/// Accept a number or a numeric string; anything else falls back to the default.
/// Numbers are truncated and clamped the same way as the env override.
fn deserialize_threshold<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    let threshold = match &value {
        serde_yaml::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(clamp_threshold)),
        serde_yaml::Value::String(s) => parse_threshold(s),
        _ => None,
    };

    Ok(threshold.unwrap_or_else(|| {
        warn!(value = ?value, default = default_threshold(), "Invalid threshold, using default");
        default_threshold()
    }))
}

fn parse_threshold(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(threshold) = raw.parse::<u64>() {
        return Some(threshold);
    }
    raw.parse::<f64>().ok().and_then(clamp_threshold)
}

fn clamp_threshold(value: f64) -> Option<u64> {
    value.is_finite().then(|| value.trunc().max(0.0) as u64)
}

/// IP extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpExtractionConfig {
    /// Proxy headers to check for the client IP, in order of preference.
    /// Empty means the peer address is always used.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Use first IP from X-Forwarded-For (true) or last IP (false).
    #[serde(default = "default_true")]
    pub use_first_ip: bool,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            use_first_ip: true,
        }
    }
}

/// In-process store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum number of counters and block records held at once.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_trusted() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a file if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Apply the legacy threshold environment variable, read once here.
    pub fn apply_env_overrides(&mut self) {
        let raw = std::env::var(THRESHOLD_ENV).ok();
        self.apply_threshold_override(raw.as_deref());
    }

    fn apply_threshold_override(&mut self, raw: Option<&str>) {
        let Some(raw) = raw else {
            return;
        };

        match parse_threshold(raw) {
            Some(threshold) => self.detection.threshold = threshold,
            None => warn!(
                variable = THRESHOLD_ENV,
                value = raw,
                threshold = self.detection.threshold,
                "Ignoring non-numeric threshold override"
            ),
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.detection.count_window_seconds == 0 {
            anyhow::bail!("count_window_seconds must be greater than 0");
        }

        if self.detection.block_duration_seconds == 0 {
            anyhow::bail!("block_duration_seconds must be greater than 0");
        }

        if self.store.max_entries == 0 {
            anyhow::bail!("store.max_entries must be greater than 0");
        }

        for header in &self.ip_extraction.headers {
            if header.trim().is_empty() {
                anyhow::bail!("ip_extraction.headers contains an empty header name");
            }
        }

        // Validate trusted entries can be parsed
        for entry in &self.trusted {
            if TrustedEntry::parse(entry).is_none() {
                anyhow::bail!("Invalid trusted entry: {}", entry);
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Scan Detection Agent Configuration

settings:
  enabled: true
  log_blocked: true

# Block a client once it produces more than `threshold` 404s within the
# counting window. The window restarts on every recorded 404.
# SCAN_DETECT_404_FOUND_TIME overrides `threshold` at startup.
detection:
  threshold: 20
  count_window_seconds: 60
  block_duration_seconds: 300

# Client IP extraction. Only list headers set by a proxy you control;
# with no headers the peer address is used.
ip_extraction:
  headers: []
  #  - "x-forwarded-for"
  #  - "x-real-ip"
  use_first_ip: true

store:
  max_entries: 100000

# Never counted or blocked. Supports single IPs and CIDR notation
trusted:
  - "127.0.0.1"
  - "::1"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern");

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.enabled);
        assert!(settings.log_blocked);
    }

    #[test]
    fn test_default_detection() {
        let detection = DetectionConfig::default();
        assert_eq!(detection.threshold, 20);
        assert_eq!(detection.count_window(), Duration::from_secs(60));
        assert_eq!(detection.block_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_trusted() {
        let config = Config::default();
        assert_eq!(config.trusted, vec!["127.0.0.1", "::1"]);
        assert!(config.ip_extraction.headers.is_empty());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("SCAN_DETECT_TEST_MAX", "512");
        let input = "max_entries: ${SCAN_DETECT_TEST_MAX}";
        let result = expand_env_vars(input);
        assert_eq!(result, "max_entries: 512");
        std::env::remove_var("SCAN_DETECT_TEST_MAX");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "value: \"${NONEXISTENT_VAR}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "value: \"\"");
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
settings:
  enabled: false

detection:
  threshold: 5
  block_duration_seconds: 600

ip_extraction:
  headers:
    - "x-real-ip"

trusted:
  - "127.0.0.1"
  - "10.0.0.0/8"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.settings.enabled);
        assert_eq!(config.detection.threshold, 5);
        assert_eq!(config.detection.count_window_seconds, 60);
        assert_eq!(config.detection.block_duration_seconds, 600);
        assert_eq!(config.ip_extraction.headers, vec!["x-real-ip"]);
        assert_eq!(config.trusted.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_numeric_string() {
        let config: Config = serde_yaml::from_str("detection:\n  threshold: \"7\"\n").unwrap();
        assert_eq!(config.detection.threshold, 7);
    }

    #[test]
    fn test_threshold_non_numeric_falls_back() {
        let config: Config = serde_yaml::from_str("detection:\n  threshold: lots\n").unwrap();
        assert_eq!(config.detection.threshold, 20);

        let config: Config = serde_yaml::from_str("detection:\n  threshold: .inf\n").unwrap();
        assert_eq!(config.detection.threshold, 20);
    }

    #[test]
    fn test_threshold_signed_and_decimal_clamp() {
        let config: Config = serde_yaml::from_str("detection:\n  threshold: -3\n").unwrap();
        assert_eq!(config.detection.threshold, 0);

        let config: Config = serde_yaml::from_str("detection:\n  threshold: 4.9\n").unwrap();
        assert_eq!(config.detection.threshold, 4);

        assert_eq!(parse_threshold("-1"), Some(0));
        assert_eq!(parse_threshold("3.5"), Some(3));
        assert_eq!(parse_threshold(" 1e3 "), Some(1000));
        assert_eq!(parse_threshold("inf"), None);
        assert_eq!(parse_threshold("NaN"), None);
        assert_eq!(parse_threshold("twenty"), None);
    }

    #[test]
    fn test_threshold_override() {
        let mut config = Config::default();

        config.apply_threshold_override(Some("3"));
        assert_eq!(config.detection.threshold, 3);

        config.apply_threshold_override(Some("abc"));
        assert_eq!(config.detection.threshold, 3);

        config.apply_threshold_override(Some("-1"));
        assert_eq!(config.detection.threshold, 0);

        config.apply_threshold_override(Some("3.5"));
        assert_eq!(config.detection.threshold, 3);

        config.apply_threshold_override(None);
        assert_eq!(config.detection.threshold, 3);
    }

    #[test]
    fn test_validate_zero_windows() {
        let mut config = Config::default();
        config.detection.count_window_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.block_duration_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_trusted_invalid() {
        let config = Config {
            trusted: vec!["not-an-ip".to_string()],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_parses() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection, DetectionConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "scan-detect-config-{}.yaml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "store:\n  max_entries: 10\ntrusted:\n  - \"::1\"").unwrap();

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.max_entries, 10);
        assert_eq!(config.trusted, vec!["::1"]);
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("scan-detect-does-not-exist.yaml");
        assert!(Config::load(&path).is_err());
    }
}
