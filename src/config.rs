use crate::canonical::Params;
use crate::error::{BrokerError, Result};
use crate::normalize::VendorParamRule;
use crate::providers::rule_key;
use indexmap::IndexMap;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub models: IndexMap<String, ModelBinding>,
    /// Parameter rewrite rules keyed by vendor identifier.
    #[serde(default)]
    pub vendors: IndexMap<String, VendorParamRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Identity reported in provenance metadata.
    #[serde(default = "default_proxy_name")]
    pub name: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub default_system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub enable_parameter_injection: bool,
    #[serde(default = "default_true")]
    pub enable_request_logging: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Separate rule store whose `vendors` table overrides inline rules.
    #[serde(default)]
    pub vendor_rules_file: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            name: default_proxy_name(),
            default_model: default_model(),
            default_system_prompt: None,
            enable_parameter_injection: true,
            enable_request_logging: true,
            timeout_secs: default_timeout_secs(),
            vendor_rules_file: None,
        }
    }
}

impl ProxySettings {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// A model alias bound to a backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelBinding {
    /// Dialect or vendor preset name (see [`crate::providers::VendorPreset`]).
    pub provider: String,
    pub model_name: String,
    pub api_key: SecretString,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Normalizer rule key; defaults to `provider`.
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub default_params: Params,
}

impl ModelBinding {
    pub fn vendor_key(&self) -> String {
        rule_key(self.vendor.as_deref().unwrap_or(&self.provider))
    }
}

#[derive(Debug, Deserialize)]
struct VendorRuleStore {
    #[serde(default)]
    vendors: IndexMap<String, VendorParamRule>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_proxy_name() -> String {
    "LLMBroker".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

const BUILTIN_CONFIG: &str = r#"
[proxy]
default_model = "gpt-3.5-turbo"

[models."gpt-3.5-turbo"]
provider = "openai"
model_name = "gpt-3.5-turbo"
api_key = "${OPENAI_API_KEY}"
default_params = { temperature = 0.7, max_tokens = 1000 }

[models."gpt-4"]
provider = "openai"
model_name = "gpt-4"
api_key = "${OPENAI_API_KEY}"
default_params = { temperature = 0.7, max_tokens = 1000 }

[models."claude-3"]
provider = "claude"
model_name = "claude-3-sonnet-20240229"
api_key = "${ANTHROPIC_API_KEY}"
default_params = { temperature = 0.7, max_tokens = 1000 }

[models.qwen]
provider = "qwen"
model_name = "qwen-turbo"
api_key = "${DASHSCOPE_API_KEY}"
default_params = { temperature = 0.7, max_tokens = 1000 }

[vendors.claude]
remove_params = ["presence_penalty", "frequency_penalty", "logit_bias", "n"]
"#;

impl BrokerConfig {
    /// Load config from a TOML or JSON file (chosen by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content, is_json(path))?;

        if let Some(rules_path) = config.proxy.vendor_rules_file.clone() {
            let rules_path = if rules_path.is_relative() {
                path.parent()
                    .map_or_else(|| rules_path.clone(), |dir| dir.join(&rules_path))
            } else {
                rules_path
            };
            config.merge_vendor_rules(&rules_path)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse config text after `${VAR}` substitution.
    pub fn parse(content: &str, json: bool) -> Result<Self> {
        let expanded = expand_env(content);
        if json {
            Ok(serde_json::from_str(&expanded)?)
        } else {
            Ok(toml::from_str(&expanded)?)
        }
    }

    /// Built-in fallback used when no config file exists.
    pub fn builtin() -> Result<Self> {
        let config = Self::parse(BUILTIN_CONFIG, false)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit_path {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                let config = Self::load(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }

        tracing::warn!("No config file found, using built-in defaults");
        Ok((Self::builtin()?, None))
    }

    fn merge_vendor_rules(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!(
                "Failed to read vendor rules {}: {}",
                path.display(),
                e
            ))
        })?;
        let expanded = expand_env(&content);
        let store: VendorRuleStore = if is_json(path) {
            serde_json::from_str(&expanded)?
        } else {
            toml::from_str(&expanded)?
        };

        tracing::info!(
            path = %path.display(),
            vendors = store.vendors.len(),
            "Loaded vendor parameter rules"
        );
        self.vendors.extend(store.vendors);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(BrokerError::config("No models configured"));
        }

        for (alias, binding) in &self.models {
            if binding.provider.trim().is_empty() {
                return Err(BrokerError::config(format!(
                    "Model '{alias}' is missing `provider`"
                )));
            }
            if binding.model_name.trim().is_empty() {
                return Err(BrokerError::config(format!(
                    "Model '{alias}' is missing `model_name`"
                )));
            }
            let key = binding.api_key.expose_secret();
            if key.trim().is_empty() {
                return Err(BrokerError::config(format!(
                    "Model '{alias}' is missing `api_key`"
                )));
            }
            if key.starts_with("${") {
                tracing::warn!(alias = %alias, placeholder = %key, "api_key placeholder was not resolved");
            }
        }

        if !self.models.contains_key(&self.proxy.default_model) {
            tracing::warn!(
                default_model = %self.proxy.default_model,
                "Default model is not among the configured models"
            );
        }

        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Replace `${VAR}` placeholders with environment values.
///
/// Unset variables are left as-is so validation can report them. Lines that are
/// TOML comments pass through untouched.
pub fn expand_env(input: &str) -> String {
    fn re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("must be valid regex")
        })
    }

    let mut output = String::with_capacity(input.len());
    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            output.push('\n');
        }
        if line.trim_start().starts_with('#') {
            output.push_str(line);
            continue;
        }
        let replaced = re().replace_all(line, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        });
        output.push_str(&replaced);
    }
    if input.ends_with('\n') {
        output.push('\n');
    }
    output
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-broker.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("llm-broker").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("llm-broker").join("config.toml"));
        paths.push(home.join(".llm-broker.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            f,
            r#"
[server]
port = 5000

[proxy]
default_model = "glm"
default_system_prompt = "Be brief."

[models.glm]
provider = "zhipu"
model_name = "glm-4-flash"
api_key = "sk-test"
default_params = {{ temperature = 0.7 }}

[models.claude-3]
provider = "claude"
model_name = "claude-3-sonnet-20240229"
api_key = "sk-ant"

[vendors.zhipu]
rename_params = {{ max_tokens = "max_output_tokens" }}
remove_params = ["logit_bias"]
extra_params = {{ safe_mode = true }}
"#
        )
        .unwrap();

        let config = BrokerConfig::load(f.path()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.proxy.default_model, "glm");
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(
            config.models.keys().collect::<Vec<_>>(),
            vec!["glm", "claude-3"]
        );

        let glm = &config.models["glm"];
        assert_eq!(glm.vendor_key(), "zhipu");
        assert_eq!(glm.default_params.get("temperature"), Some(&json!(0.7)));

        let rule = &config.vendors["zhipu"];
        assert_eq!(
            rule.rename_params.get("max_tokens").map(String::as_str),
            Some("max_output_tokens")
        );
        assert_eq!(rule.extra_params.get("safe_mode"), Some(&json!(true)));
    }

    #[test]
    fn test_load_json_config() {
        let mut f = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            f,
            r#"{{"models": {{"qwen": {{"provider": "qwen", "model_name": "qwen-turbo", "api_key": "k"}}}}}}"#
        )
        .unwrap();

        let config = BrokerConfig::load(f.path()).unwrap();
        assert_eq!(config.models["qwen"].provider, "qwen");
        assert_eq!(config.proxy.name, "LLMBroker");
    }

    #[test]
    fn test_vendor_rules_file_overrides_inline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("rules.toml"),
            "[vendors.openai]\nremove_params = [\"user\"]\n",
        )
        .unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[proxy]
vendor_rules_file = "rules.toml"

[models.gpt]
provider = "openai"
model_name = "gpt-4"
api_key = "k"

[vendors.openai]
remove_params = ["seed"]
"#,
        )
        .unwrap();

        let config = BrokerConfig::load(&config_path).unwrap();
        assert_eq!(config.vendors["openai"].remove_params, vec!["user"]);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let config = BrokerConfig::parse(
            "[models.a]\nprovider = \"openai\"\nmodel_name = \"\"\napi_key = \"k\"\n",
            false,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(BrokerError::Config { .. })));

        let empty = BrokerConfig::parse("", false).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("LLM_BROKER_TEST_KEY", "secret-value");
        let out = expand_env("api_key = \"${LLM_BROKER_TEST_KEY}\"\n# ${LLM_BROKER_TEST_KEY}\n");
        assert_eq!(out, "api_key = \"secret-value\"\n# ${LLM_BROKER_TEST_KEY}\n");

        let untouched = expand_env("api_key = \"${LLM_BROKER_SURELY_UNSET_VAR}\"");
        assert_eq!(untouched, "api_key = \"${LLM_BROKER_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_builtin_config() {
        let config = BrokerConfig::builtin().unwrap();
        assert!(config.models.contains_key("gpt-3.5-turbo"));
        assert!(config.models.contains_key("claude-3"));
        assert!(config.vendors.contains_key("claude"));
    }
}
