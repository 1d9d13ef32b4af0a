//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// A browser flag that can be forced on, forced off, or left to the driver.
///
/// In TOML this is written as `true`, `false` or `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TriStateRepr", into = "TriStateRepr")]
pub enum TriState {
    On,
    Off,
    Unspecified,
}

impl TriState {
    /// `None` means "do not force either way".
    pub fn as_option(self) -> Option<bool> {
        match self {
            TriState::On => Some(true),
            TriState::Off => Some(false),
            TriState::Unspecified => None,
        }
    }

    /// Parse the textual forms accepted by env overrides and the CLI.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(TriState::On),
            "false" | "0" | "no" | "off" => Some(TriState::Off),
            "auto" | "unset" | "" => Some(TriState::Unspecified),
            _ => None,
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => TriState::On,
            Some(false) => TriState::Off,
            None => TriState::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TriStateRepr {
    Bool(bool),
    Text(String),
}

impl TryFrom<TriStateRepr> for TriState {
    type Error = String;

    fn try_from(repr: TriStateRepr) -> Result<Self, Self::Error> {
        match repr {
            TriStateRepr::Bool(b) => Ok(Some(b).into()),
            TriStateRepr::Text(s) => {
                TriState::parse(&s).ok_or_else(|| format!("invalid tri-state value '{}'", s))
            }
        }
    }
}

impl From<TriState> for TriStateRepr {
    fn from(value: TriState) -> Self {
        match value {
            TriState::On => TriStateRepr::Bool(true),
            TriState::Off => TriStateRepr::Bool(false),
            TriState::Unspecified => TriStateRepr::Text("auto".to_string()),
        }
    }
}

/// Image format written for enhanced outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpg,
}

impl OutputFormat {
    /// File extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "png" => Some(OutputFormat::Png),
            "jpg" | "jpeg" => Some(OutputFormat::Jpg),
            _ => None,
        }
    }
}

/// Remote enhancement session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Run the browser headless (default on)
    #[serde(default = "default_tri_on")]
    pub headless: TriState,
    /// Run the browser in a private/incognito profile (default on)
    #[serde(default = "default_tri_on")]
    pub private_mode: TriState,
    /// Base URL of the WebDriver server
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    /// Page that hosts the enhancement tool
    #[serde(default = "default_page_url")]
    pub page_url: String,
    /// CSS selector of the file upload control
    #[serde(default = "default_upload_selector")]
    pub upload_selector: String,
    /// CSS selectors probed, in order, for the enhanced result image
    #[serde(default = "default_result_selectors")]
    pub result_selectors: Vec<String>,
    /// Interval between readiness/result polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_tri_on() -> TriState {
    TriState::On
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:9515".to_string()
}

fn default_page_url() -> String {
    "https://picsart.com/ai-image-enhancer/".to_string()
}

fn default_upload_selector() -> String {
    "input[type='file']".to_string()
}

fn default_result_selectors() -> Vec<String> {
    vec![
        "div[data-testid=\"EnhancedImage\"] img".to_string(),
        "img[alt*=\"enhanced\"]".to_string(),
        "div[data-testid=\"EnhancedImage\"] *[src]".to_string(),
    ]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: default_tri_on(),
            private_mode: default_tri_on(),
            webdriver_url: default_webdriver_url(),
            page_url: default_page_url(),
            upload_selector: default_upload_selector(),
            result_selectors: default_result_selectors(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Batch-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Number of sessions driven together (clamped to [1, 20] at run time)
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

/// Output placement configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    /// Name of the sibling directory that receives enhanced outputs
    #[serde(default = "default_output_dir_name")]
    pub dir_name: String,
}

fn default_output_dir_name() -> String {
    "UPSCALE".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            dir_name: default_output_dir_name(),
        }
    }
}

/// External media tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Video pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    /// Root directory for extracted frame sets
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Drop the source audio track when merging
    #[serde(default)]
    pub mute_audio: bool,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("temp")
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            mute_audio: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENHANCE_CONCURRENCY -> batch.concurrency
    /// - ENHANCE_HEADLESS -> session.headless (true/false/auto)
    /// - ENHANCE_PRIVATE_MODE -> session.private_mode (true/false/auto)
    /// - ENHANCE_WEBDRIVER_URL -> session.webdriver_url
    /// - ENHANCE_OUTPUT_FORMAT -> output.format
    /// - ENHANCE_FFMPEG_PATH -> tools.ffmpeg_path
    /// - ENHANCE_FFPROBE_PATH -> tools.ffprobe_path
    ///
    /// Unparsable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENHANCE_CONCURRENCY") {
            if let Ok(concurrency) = val.parse::<u32>() {
                self.batch.concurrency = concurrency;
            }
        }

        if let Ok(val) = env::var("ENHANCE_HEADLESS") {
            if let Some(state) = TriState::parse(&val) {
                self.session.headless = state;
            }
        }

        if let Ok(val) = env::var("ENHANCE_PRIVATE_MODE") {
            if let Some(state) = TriState::parse(&val) {
                self.session.private_mode = state;
            }
        }

        if let Ok(val) = env::var("ENHANCE_WEBDRIVER_URL") {
            if !val.trim().is_empty() {
                self.session.webdriver_url = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("ENHANCE_OUTPUT_FORMAT") {
            if let Some(format) = OutputFormat::parse(&val) {
                self.output.format = format;
            }
        }

        if let Ok(val) = env::var("ENHANCE_FFMPEG_PATH") {
            if !val.is_empty() {
                self.tools.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("ENHANCE_FFPROBE_PATH") {
            if !val.is_empty() {
                self.tools.ffprobe_path = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("ENHANCE_CONCURRENCY");
        env::remove_var("ENHANCE_HEADLESS");
        env::remove_var("ENHANCE_PRIVATE_MODE");
        env::remove_var("ENHANCE_WEBDRIVER_URL");
        env::remove_var("ENHANCE_OUTPUT_FORMAT");
        env::remove_var("ENHANCE_FFMPEG_PATH");
        env::remove_var("ENHANCE_FFPROBE_PATH");
    }

    fn tri_state_strategy() -> impl Strategy<Value = TriState> {
        prop_oneof![
            Just(TriState::On),
            Just(TriState::Off),
            Just(TriState::Unspecified),
        ]
    }

    fn tri_state_toml(state: TriState) -> &'static str {
        match state {
            TriState::On => "true",
            TriState::Off => "false",
            TriState::Unspecified => "\"auto\"",
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            headless in tri_state_strategy(),
            private_mode in tri_state_strategy(),
            concurrency in 0u32..64,
            poll_ms in 0u64..10_000,
            jpg in proptest::bool::ANY,
            mute in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[session]
headless = {}
private_mode = {}
poll_interval_ms = {}

[batch]
concurrency = {}

[output]
format = "{}"

[video]
mute_audio = {}
"#,
                tri_state_toml(headless),
                tri_state_toml(private_mode),
                poll_ms,
                concurrency,
                if jpg { "jpg" } else { "png" },
                mute,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.session.headless, headless);
            prop_assert_eq!(config.session.private_mode, private_mode);
            prop_assert_eq!(config.session.poll_interval_ms, poll_ms);
            prop_assert_eq!(config.batch.concurrency, concurrency);
            prop_assert_eq!(
                config.output.format,
                if jpg { OutputFormat::Jpg } else { OutputFormat::Png }
            );
            prop_assert_eq!(config.video.mute_audio, mute);
        }

        #[test]
        fn prop_env_overrides_concurrency(
            initial in 1u32..20,
            override_value in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[batch]\nconcurrency = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ENHANCE_CONCURRENCY", override_value.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.batch.concurrency, override_value);
        }

        #[test]
        fn prop_env_overrides_headless(
            initial in tri_state_strategy(),
            override_state in tri_state_strategy(),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[session]\nheadless = {}\n", tri_state_toml(initial));
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            let text = match override_state {
                TriState::On => "true",
                TriState::Off => "false",
                TriState::Unspecified => "auto",
            };
            env::set_var("ENHANCE_HEADLESS", text);
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.session.headless, override_state);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.session.headless, TriState::On);
        assert_eq!(config.session.private_mode, TriState::On);
        assert_eq!(config.session.poll_interval_ms, 1000);
        assert_eq!(config.session.webdriver_url, "http://127.0.0.1:9515");
        assert!(!config.session.result_selectors.is_empty());
        assert_eq!(config.batch.concurrency, 1);
        assert_eq!(config.output.format, OutputFormat::Png);
        assert_eq!(config.output.dir_name, "UPSCALE");
        assert_eq!(config.tools.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.video.work_dir, PathBuf::from("temp"));
        assert!(!config.video.mute_audio);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[batch]
concurrency = 4
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.batch.concurrency, 4);
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.output, OutputConfig::default());
    }

    #[test]
    fn test_invalid_tri_state_is_rejected() {
        let result = Config::parse_toml("[session]\nheadless = \"sometimes\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_tri_state_round_trips_through_toml() {
        let mut config = Config::default();
        config.session.headless = TriState::Unspecified;
        config.session.private_mode = TriState::Off;

        let text = toml::to_string(&config).expect("serialize");
        let parsed = Config::parse_toml(&text).expect("parse back");

        assert_eq!(parsed, config);
        assert_eq!(parsed.session.headless.as_option(), None);
        assert_eq!(parsed.session.private_mode.as_option(), Some(false));
    }

    #[test]
    fn test_invalid_env_values_keep_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ENHANCE_CONCURRENCY", "many");
        env::set_var("ENHANCE_OUTPUT_FORMAT", "tiff");
        env::set_var("ENHANCE_PRIVATE_MODE", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.batch.concurrency, 1);
        assert_eq!(config.output.format, OutputFormat::Png);
        assert_eq!(config.session.private_mode, TriState::On);
    }

    #[test]
    fn test_env_overrides_paths_and_format() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ENHANCE_OUTPUT_FORMAT", "JPEG");
        env::set_var("ENHANCE_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("ENHANCE_WEBDRIVER_URL", "http://localhost:4444");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.output.format, OutputFormat::Jpg);
        assert_eq!(
            config.tools.ffmpeg_path,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
        assert_eq!(config.session.webdriver_url, "http://localhost:4444");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/frame-enhance/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }
}
