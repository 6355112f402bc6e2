//! Agent configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional file
//! (format picked from its extension, `${VAR}` references expanded), then
//! `EEA_`-prefixed environment variables.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::agent::AgentOptions;
use super::exports::GuestSettings;
use super::instance::InstanceConfig;
use super::transport::{CompilerOptions, TopicLayout};
use super::types::{EeaError, EeaResult};

pub const ENV_PREFIX: &str = "EEA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device_id: String,
    pub access_key: Option<String>,
    pub access_secret: Option<String>,

    pub broker_host: String,
    pub broker_port: u16,
    pub broker_tls: bool,
    pub keep_alive_secs: u64,
    /// Root of every device topic
    pub base_topic: String,
    pub extra_topics: Vec<String>,

    /// Where the last accepted artifact is kept
    pub artifact_path: Option<PathBuf>,
    /// Guest storage blob; kept in memory when unset
    pub storage_path: Option<PathBuf>,

    pub trace_level: i32,
    pub debug_enabled: bool,
    pub topic_buffer_length: u32,
    pub payload_buffer_length: u32,
    pub queue_size: u32,
    pub storage_size: u32,
    pub storage_interval_ms: u32,
    pub loop_interval_ms: u64,
    pub memory_pages: u32,
    pub max_memory_pages: u32,

    pub agent_version: String,
    pub export_memory: Option<bool>,
    pub disable_debug_message: Option<bool>,
    pub debug_symbols: Option<bool>,
    pub stack_size: Option<u32>,
    pub gzip: Option<bool>,

    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let guest = GuestSettings::default();
        Self {
            device_id: String::new(),
            access_key: None,
            access_secret: None,
            broker_host: "broker.losant.com".to_string(),
            broker_port: 8883,
            broker_tls: true,
            keep_alive_secs: 30,
            base_topic: "losant".to_string(),
            extra_topics: Vec::new(),
            artifact_path: Some(PathBuf::from("data/eea_bundle.wasm")),
            storage_path: Some(PathBuf::from("data/eea_storage.bin")),
            trace_level: guest.trace_level,
            debug_enabled: guest.debug_enabled,
            topic_buffer_length: guest.topic_buffer_length,
            payload_buffer_length: guest.payload_buffer_length,
            queue_size: guest.queue_size,
            storage_size: guest.storage_size,
            storage_interval_ms: guest.storage_interval_ms,
            loop_interval_ms: 1000,
            memory_pages: 8,
            max_memory_pages: 256,
            agent_version: "1.0.0".to_string(),
            export_memory: None,
            disable_debug_message: None,
            debug_symbols: None,
            stack_size: None,
            gzip: None,
            log_level: "info".to_string(),
        }
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> EeaResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| EeaError::Config("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(EeaError::Config(format!("Unsupported format: {}", ext))),
    }
}

/// Expand `${VAR}` references; unknown variables are left as written
pub fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

impl AgentConfig {
    /// Defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> EeaResult<Self> {
        let mut builder = Cfg::builder();

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path).map_err(|e| {
                EeaError::Config(format!("Could not read {}: {}", path.display(), e))
            })?;
            builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("extra_topics"),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EeaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single document with an explicit format
    pub fn from_str(content: &str, format: FileFormat) -> EeaResult<Self> {
        let config: Self = Cfg::builder()
            .add_source(File::from_str(&substitute_env_vars(content), format))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EeaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EeaResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(EeaError::Config("device_id is required".to_string()));
        }
        if self.loop_interval_ms == 0 {
            return Err(EeaError::Config("loop_interval_ms must be positive".to_string()));
        }
        if self.memory_pages > self.max_memory_pages {
            return Err(EeaError::Config(format!(
                "memory_pages ({}) exceeds max_memory_pages ({})",
                self.memory_pages, self.max_memory_pages
            )));
        }
        Ok(())
    }

    pub fn guest_settings(&self) -> GuestSettings {
        GuestSettings {
            debug_enabled: self.debug_enabled,
            topic_buffer_length: self.topic_buffer_length,
            payload_buffer_length: self.payload_buffer_length,
            queue_size: self.queue_size,
            storage_interval_ms: self.storage_interval_ms,
            storage_size: self.storage_size,
            trace_level: self.trace_level,
        }
    }

    pub fn instance_config(&self) -> InstanceConfig {
        InstanceConfig {
            settings: self.guest_settings(),
            memory_pages: self.memory_pages,
            max_memory_pages: self.max_memory_pages,
            connected: false,
        }
    }

    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            trace_level: self.trace_level,
            export_memory: self.export_memory,
            disable_debug_message: self.disable_debug_message,
            debug_symbols: self.debug_symbols,
            stack_size: self.stack_size,
            gzip: self.gzip,
        }
    }

    pub fn topic_layout(&self) -> TopicLayout {
        TopicLayout::new(self.base_topic.clone(), self.device_id.clone())
            .with_extra_topics(self.extra_topics.iter().cloned())
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            loop_interval: Duration::from_millis(self.loop_interval_ms),
            agent_version: self.agent_version.clone(),
            compiler_options: self.compiler_options(),
            ..AgentOptions::new(self.topic_layout())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.base_topic, "losant");
        assert_eq!(config.topic_buffer_length, 256);
        assert_eq!(config.payload_buffer_length, 4096);
        assert_eq!(config.queue_size, 1_024_000);
        assert_eq!(config.storage_interval_ms, 60_000);
        assert_eq!(config.loop_interval_ms, 1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
device_id = "abc123"
base_topic = "acme"
loop_interval_ms = 250
extra_topics = ["foo", "bar"]
gzip = true
"#;
        let config = AgentConfig::from_str(toml, FileFormat::Toml).unwrap();
        assert_eq!(config.device_id, "abc123");
        assert_eq!(config.loop_interval_ms, 250);
        assert_eq!(config.payload_buffer_length, 4096);

        let layout = config.topic_layout();
        assert_eq!(layout.hello(), "acme/abc123/fromAgent/hello");
        assert_eq!(layout.subscriptions().len(), 4);
        assert_eq!(config.compiler_options().gzip, Some(true));
        assert_eq!(config.agent_options().loop_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "device_id: dev-yaml\nmemory_pages: 4\ntrace_level: 2").unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.device_id, "dev-yaml");
        assert_eq!(config.instance_config().memory_pages, 4);
        assert_eq!(config.guest_settings().trace_level, 2);
    }

    #[test]
    fn test_invalid_memory_pages() {
        let json = r#"{ "device_id": "d", "memory_pages": 512 }"#;
        assert!(matches!(
            AgentConfig::from_str(json, FileFormat::Json),
            Err(EeaError::Config(_))
        ));
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("a.yml")).unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format(Path::new("a.TOML")).unwrap(), FileFormat::Toml);
        assert!(detect_format(Path::new("a.txt")).is_err());
        assert!(detect_format(Path::new("noext")).is_err());
    }

    #[test]
    fn test_substitute_env_vars() {
        let out = substitute_env_vars("key: ${EEA_SURELY_UNSET_VARIABLE_42}");
        assert_eq!(out, "key: ${EEA_SURELY_UNSET_VARIABLE_42}");
    }
}
