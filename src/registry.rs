//! Language registry loaded once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Placeholder for the materialized source file.
pub const FILE_PLACEHOLDER: &str = "{file}";
/// Placeholder for the artifact produced by a compile step.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("cannot read language registry {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed language registry: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid language {key:?}: {reason}")]
    Invalid { key: String, reason: String },
}

/// A run or compile command, split into an argument vector at load time.
///
/// Placeholders are substituted after splitting, so a substituted path always
/// stays a single argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandTemplate {
    tokens: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Option<Self> {
        let tokens: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return None;
        }
        Some(Self { tokens })
    }

    /// Produces `(program, args)` for the given source and artifact paths.
    /// Templates referencing neither placeholder get the source path appended.
    pub fn render(&self, file: &Path, output: &Path) -> (String, Vec<String>) {
        let file = file.to_string_lossy();
        let output = output.to_string_lossy();
        let mut argv: Vec<String> = self
            .tokens
            .iter()
            .map(|t| {
                t.replace(FILE_PLACEHOLDER, &file)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect();
        if !self
            .tokens
            .iter()
            .any(|t| t.contains(FILE_PLACEHOLDER) || t.contains(OUTPUT_PLACEHOLDER))
        {
            argv.push(file.into_owned());
        }
        let program = argv.remove(0);
        (program, argv)
    }
}

impl TryFrom<String> for CommandTemplate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CommandTemplate::parse(&value).ok_or_else(|| "command template is empty".to_string())
    }
}

impl From<CommandTemplate> for String {
    fn from(template: CommandTemplate) -> Self {
        template.tokens.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageRuntime {
    #[serde(skip)]
    pub key: String,
    pub display_name: String,
    pub short_name: String,
    pub file_extension: String,
    #[serde(default)]
    pub placeholder_snippet: String,
    pub run_command_template: CommandTemplate,
    #[serde(default)]
    pub compile_command_template: Option<CommandTemplate>,
}

impl LanguageRuntime {
    /// Extension without any leading dot.
    pub fn extension(&self) -> &str {
        self.file_extension.trim_start_matches('.')
    }
}

/// Immutable key -> runtime map, cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    runtimes: Arc<HashMap<String, LanguageRuntime>>,
}

impl LanguageRegistry {
    /// Loads the registry file. Any error here is fatal for the process.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&raw)?;
        info!(path = %path.display(), languages = registry.len(), "Loaded language registry");
        Ok(registry)
    }

    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let mut runtimes: HashMap<String, LanguageRuntime> = serde_json::from_str(raw)?;
        for (key, runtime) in runtimes.iter_mut() {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(RegistryError::Invalid {
                    key: key.clone(),
                    reason: "keys must be non-empty and contain no whitespace".to_string(),
                });
            }
            if runtime.extension().is_empty() {
                return Err(RegistryError::Invalid {
                    key: key.clone(),
                    reason: "fileExtension is empty".to_string(),
                });
            }
            runtime.key = key.clone();
        }
        Ok(Self {
            runtimes: Arc::new(runtimes),
        })
    }

    pub fn get(&self, key: &str) -> Option<&LanguageRuntime> {
        self.runtimes.get(key)
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_registry;
    use super::*;

    #[test]
    fn keys_are_filled_from_the_map() {
        let registry = sample_registry();
        let py = registry.get("py").unwrap();
        assert_eq!(py.key, "py");
        assert_eq!(py.display_name, "Python");
        assert!(py.compile_command_template.is_none());
        assert!(registry.get("cobol77").is_none());
    }

    #[test]
    fn malformed_registry_is_an_error() {
        assert!(matches!(
            LanguageRegistry::from_json("{ not json"),
            Err(RegistryError::Malformed(_))
        ));
        let empty_command = r#"{"x": {"displayName": "X", "shortName": "x",
            "fileExtension": "x", "runCommandTemplate": "   "}}"#;
        assert!(LanguageRegistry::from_json(empty_command).is_err());
    }

    #[test]
    fn key_with_space_is_rejected() {
        let raw = r#"{"two words": {"displayName": "X", "shortName": "x",
            "fileExtension": "x", "runCommandTemplate": "x"}}"#;
        assert!(matches!(
            LanguageRegistry::from_json(raw),
            Err(RegistryError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = LanguageRegistry::load(Path::new("/nonexistent/languages.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Read { .. }));
    }

    #[test]
    fn template_appends_file_when_not_referenced() {
        let template = CommandTemplate::parse("node --no-warnings").unwrap();
        let (program, args) = template.render(Path::new("/tmp/a.js"), Path::new("/tmp/a"));
        assert_eq!(program, "node");
        assert_eq!(args, vec!["--no-warnings", "/tmp/a.js"]);
    }

    #[test]
    fn template_substitutes_placeholders_as_single_arguments() {
        let template = CommandTemplate::parse("rustc -o {output} {file}").unwrap();
        let (program, args) = template.render(
            Path::new("/tmp/dir with space/a.rs"),
            Path::new("/tmp/dir with space/a"),
        );
        assert_eq!(program, "rustc");
        assert_eq!(
            args,
            vec!["-o", "/tmp/dir with space/a", "/tmp/dir with space/a.rs"]
        );

        let run = CommandTemplate::parse("{output}").unwrap();
        let (program, args) = run.render(Path::new("/w/a.rs"), Path::new("/w/a"));
        assert_eq!(program, "/w/a");
        assert!(args.is_empty());
    }

    #[test]
    fn bundled_registry_parses() {
        let raw = include_str!("../languages.json");
        let registry = LanguageRegistry::from_json(raw).unwrap();
        assert!(registry.get("js").is_some());
        assert!(registry.get("py").is_some());
    }
}
