// Language registry: the static table of sandbox parameters per language.
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sandbox parameters for one supported language.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    /// Sandbox image reference.
    pub image: String,
    /// File suffix used when materializing code.
    pub extension: String,
    /// argv[0] inside the sandbox.
    pub executor: String,
    /// Wall-clock cap for execution.
    pub timeout: Duration,
    /// Language-specific hygiene variables set in the container.
    pub env: Vec<String>,
}

/// Read-only mapping from language identifier to its sandbox parameters.
/// Built once at process start and never mutated.
pub struct LanguageRegistry {
    specs: HashMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// The built-in table.
    pub fn builtin() -> Self {
        let mut specs = HashMap::new();
        specs.insert(
            "python".to_string(),
            LanguageSpec {
                image: "python:3.9-alpine".to_string(),
                extension: ".py".to_string(),
                executor: "python3".to_string(),
                timeout: DEFAULT_TIMEOUT,
                env: vec!["PYTHONDONTWRITEBYTECODE=1".to_string()],
            },
        );
        specs.insert(
            "javascript".to_string(),
            LanguageSpec {
                image: "node:18-alpine".to_string(),
                extension: ".js".to_string(),
                executor: "node".to_string(),
                timeout: DEFAULT_TIMEOUT,
                env: vec!["NODE_ENV=production".to_string()],
            },
        );
        Self { specs }
    }

    /// Load the registry from a languages.json file, replacing the built-in
    /// table entirely.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let mut specs = HashMap::new();
        for entry in parsed.languages {
            specs.insert(
                entry.name,
                LanguageSpec {
                    image: entry.image,
                    extension: entry.extension,
                    executor: entry.executor,
                    timeout: Duration::from_millis(entry.timeout_ms),
                    env: entry.env,
                },
            );
        }
        Ok(Self { specs })
    }

    pub fn lookup(&self, language: &str) -> Option<&LanguageSpec> {
        self.specs.get(language)
    }

    /// Supported language identifiers, sorted for stable log output.
    pub fn supported(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.specs.keys().cloned().collect();
        languages.sort();
        languages
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageEntry>,
}

#[derive(Debug, Deserialize)]
struct LanguageEntry {
    name: String,
    image: String,
    extension: String,
    executor: String,
    timeout_ms: u64,
    #[serde(default)]
    env: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn builtin_table_covers_the_configured_set() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(registry.supported(), vec!["javascript", "python"]);

        let python = registry.lookup("python").unwrap();
        assert_eq!(python.image, "python:3.9-alpine");
        assert_eq!(python.extension, ".py");
        assert_eq!(python.executor, "python3");
        assert_eq!(python.timeout, Duration::from_secs(5));

        let js = registry.lookup("javascript").unwrap();
        assert_eq!(js.image, "node:18-alpine");
        assert_eq!(js.executor, "node");
    }

    #[test]
    fn unknown_language_is_not_registered() {
        let registry = LanguageRegistry::builtin();
        assert!(registry.lookup("brainfuck").is_none());
        assert!(registry.lookup("Python").is_none());
    }

    #[test]
    fn registry_loads_from_override_file() {
        let path = std::env::temp_dir().join(format!("languages-{}.json", Uuid::new_v4()));
        fs::write(
            &path,
            r#"{
                "languages": [
                    {
                        "name": "python",
                        "image": "python:3.12-alpine",
                        "extension": ".py",
                        "executor": "python3",
                        "timeout_ms": 10000
                    }
                ]
            }"#,
        )
        .unwrap();

        let registry = LanguageRegistry::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(registry.supported(), vec!["python"]);
        let python = registry.lookup("python").unwrap();
        assert_eq!(python.image, "python:3.12-alpine");
        assert_eq!(python.timeout, Duration::from_secs(10));
        assert!(python.env.is_empty());
        assert!(registry.lookup("javascript").is_none());
    }

    #[test]
    fn missing_override_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("languages-{}.json", Uuid::new_v4()));
        assert!(LanguageRegistry::from_file(&path).is_err());
    }
}
