use std::path::Path;

use regex::Regex;
use serde_yaml::Value;

use super::AppConfig;

/// Loads `base.yaml` overlaid with `<ENVIRONMENT>.yaml` (when present) and
/// resolves `${VAR}` / `${VAR:default}` references against the process
/// environment.
pub struct Loader {
    environment: String,
}

impl Loader {
    pub fn new() -> Self {
        Self {
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
        }
    }

    pub fn with_environment(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn load(&self, config_dir: impl AsRef<Path>) -> Result<AppConfig, String> {
        let config_dir = config_dir.as_ref();

        let base = load_yaml_file(&config_dir.join("base.yaml"))
            .map_err(|err| format!("failed to load base config: {err}"))?;

        // The environment overlay is optional.
        let overlay = load_yaml_file(&config_dir.join(format!("{}.yaml", self.environment)))
            .unwrap_or(Value::Mapping(Default::default()));

        let merged = deep_merge(base, overlay);
        let resolved = resolve_env_vars(merged);

        let config: AppConfig = serde_yaml::from_value(resolved)
            .map_err(|err| format!("failed to parse config: {err}"))?;
        config
            .validate()
            .map_err(|err| format!("configuration validation failed: {err}"))?;
        Ok(config)
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_yaml_file(path: &Path) -> Result<Value, String> {
    let raw = std::fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    serde_yaml::from_str(&raw).map_err(|err| format!("{}: {err}", path.display()))
}

/// Mappings merge recursively, everything else is replaced by the override.
fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

fn resolve_env_vars(value: Value) -> Value {
    match value {
        Value::String(raw) => Value::String(resolve_env_var(&raw)),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(key, value)| (key, resolve_env_vars(value)))
                .collect(),
        ),
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(resolve_env_vars).collect())
        }
        other => other,
    }
}

fn resolve_env_var(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}]+)\}").expect("env var pattern");
    pattern
        .replace_all(raw, |captures: &regex::Captures<'_>| {
            let reference = &captures[1];
            let (name, default) = match reference.split_once(':') {
                Some((name, default)) => (name, default),
                None => (reference, ""),
            };
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => value,
                _ => default.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_overrides_scalars_and_merges_mappings() {
        let base: Value = serde_yaml::from_str(
            r#"
port: 8080
logging:
  level: INFO
  file: /var/log/proxy.log
"#,
        )
        .unwrap();
        let overlay: Value = serde_yaml::from_str(
            r#"
port: 9090
logging:
  level: DEBUG
"#,
        )
        .unwrap();

        let merged = deep_merge(base, overlay);
        assert_eq!(merged["port"], Value::Number(9090.into()));
        assert_eq!(merged["logging"]["level"], Value::String("DEBUG".into()));
        assert_eq!(
            merged["logging"]["file"],
            Value::String("/var/log/proxy.log".into())
        );
    }

    #[test]
    fn resolves_env_references_with_defaults() {
        std::env::set_var("LOADER_TEST_KEY", "sk-from-env");
        assert_eq!(resolve_env_var("${LOADER_TEST_KEY}"), "sk-from-env");
        assert_eq!(
            resolve_env_var("${LOADER_TEST_MISSING:fallback}"),
            "fallback"
        );
        assert_eq!(resolve_env_var("${LOADER_TEST_MISSING}"), "");
        assert_eq!(
            resolve_env_var("prefix-${LOADER_TEST_KEY}-suffix"),
            "prefix-sk-from-env-suffix"
        );
    }

    #[test]
    fn loads_and_validates_from_directory() {
        let dir = std::env::temp_dir().join(format!(
            "proxy-loader-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("base.yaml"),
            r#"
port: 8080
instances:
  - name: azure-east
    provider_type: azure
    api_key: ${LOADER_TEST_API_KEY:sk-default}
    api_base: https://east.openai.azure.com
    max_tpm: 60000
    supported_models: [gpt-4]
    enabled: true
routing:
  strategy: failover
  retries: 3
  timeout: 60
"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("staging.yaml"),
            r#"
port: 9090
"#,
        )
        .unwrap();

        let config = Loader::with_environment("staging").load(&dir).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].api_key, "sk-default");
        assert_eq!(config.instances[0].api_version, "2024-05-01-preview");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_base_config_is_an_error() {
        let dir = std::env::temp_dir().join("proxy-loader-test-missing");
        assert!(Loader::with_environment("development").load(&dir).is_err());
    }
}
