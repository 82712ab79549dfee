//! Configuration compiler for llm-relay.
//!
//! Config is loaded once at startup from a JSON or TOML document and compiled
//! into an immutable [`RoutingTable`] before the server opens any ports.
//! Invalid configs are rejected with a typed [`ConfigError`] rather than
//! silently falling back to defaults; there is no hot-reload (restart to pick
//! up changes).
//!
//! # Example
//! ```json
//! {
//!   "version": "4.0",
//!   "server": { "port": 3456, "host": "127.0.0.1", "debug": false },
//!   "Providers": [
//!     {
//!       "name": "openrouter",
//!       "api_base_url": "https://openrouter.ai/api/v1",
//!       "credentialRef": "openrouter",
//!       "models": [ { "name": "anthropic/claude-sonnet-4", "maxTokens": 64000 } ]
//!     }
//!   ],
//!   "router": { "default": "openrouter,anthropic/claude-sonnet-4" }
//! }
//! ```
//!
//! Unknown fields are tolerated and ignored. The `router` section maps route
//! names to `"<provider>,<model>"` pairs; a missing `default` route is
//! synthesised from the first provider's first model (with a warning).

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Compatibility profiles with a registered server-compatibility stage.
pub const KNOWN_COMPAT_PROFILES: &[&str] = &["openai-generic", "lmstudio", "qwen", "iflow"];

/// Terminal startup errors from the config compiler. Each maps to exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),

    #[error("config parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("config schema error at `{field}`: {message}")]
    Schema { field: String, message: String },

    #[error("config reference error at `{field}`: {message}")]
    Reference { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Source document (wire shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    version: Option<String>,
    server: ServerSection,
    #[serde(rename = "Providers", default)]
    providers: Vec<ProviderSection>,
    #[serde(default)]
    router: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: u16,
    #[serde(default = "defaults::host")]
    host: String,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    debug_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ProviderSection {
    name: String,
    api_base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(rename = "credentialRef", alias = "credential_ref", default)]
    credential_ref: Option<String>,
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(rename = "serverCompatibility", alias = "server_compatibility", default)]
    server_compatibility: Option<CompatSection>,
}

/// A model is either a bare name or a `{name, maxTokens}` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(rename = "maxTokens", alias = "max_tokens", default = "defaults::max_tokens")]
        max_tokens: u64,
    },
}

#[derive(Debug, Deserialize)]
struct CompatSection {
    #[serde(rename = "use")]
    profile: String,
    #[serde(default)]
    options: Value,
}

// ---------------------------------------------------------------------------
// Routing table (compiled, immutable)
// ---------------------------------------------------------------------------

/// Compiled configuration — produced once per startup, immutable thereafter.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Providers in document order.
    pub providers: Vec<Provider>,
    /// Route name → `(provider, model)` target.
    pub routes: BTreeMap<String, RouteTarget>,
    pub server: ServerSettings,
    pub metadata: TableMetadata,
    /// Non-fatal findings surfaced to the operator at startup.
    pub warnings: Vec<String>,
}

impl RoutingTable {
    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// A logical upstream.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    /// Models in document order.
    pub models: Vec<ModelSpec>,
    pub credential: CredentialSpec,
    pub compat_profile: String,
    pub compat_options: Value,
}

impl Provider {
    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Opaque handle into the CredentialManager for this provider's material.
    pub fn credential_ref(&self) -> String {
        match &self.credential {
            CredentialSpec::Reference(name) => name.clone(),
            CredentialSpec::Inline { .. } => format!("inline:{}", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub max_tokens: u64,
}

/// Where a provider's credential material comes from.
#[derive(Debug, Clone)]
pub enum CredentialSpec {
    /// Static key given inline in the config document.
    Inline { api_key: String },
    /// Named credential file in the credentials directory.
    Reference(String),
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub host: String,
    pub debug: bool,
    pub debug_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// `"json"` or `"toml"`, from the config file extension.
    pub source_format: String,
    pub processing_time_ms: u64,
    pub config_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Load, validate and normalise a config document into a [`RoutingTable`].
///
/// `credentials_dir` is used only to check that every `credentialRef` names an
/// existing file; material validity is the CredentialManager's concern.
pub fn preprocess(path: &Path, credentials_dir: &Path) -> Result<RoutingTable, ConfigError> {
    let started = Instant::now();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() });
        }
    };

    let source_format = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => "toml",
        _ => "json",
    };

    let document: ConfigDocument = match source_format {
        "toml" => toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?,
        _ => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?,
    };

    let mut warnings = Vec::new();
    let (providers, routes, server) =
        validate(document, credentials_dir, &mut warnings)?;

    Ok(RoutingTable {
        providers,
        routes,
        server,
        metadata: TableMetadata {
            source_format: source_format.to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            config_path: path.to_path_buf(),
        },
        warnings,
    })
}

#[allow(clippy::type_complexity)]
fn validate(
    document: ConfigDocument,
    credentials_dir: &Path,
    warnings: &mut Vec<String>,
) -> Result<(Vec<Provider>, BTreeMap<String, RouteTarget>, ServerSettings), ConfigError> {
    if let Some(version) = document.version.as_deref() {
        if version != "4.0" {
            warnings.push(format!("config version `{version}` (expected \"4.0\")"));
        }
    }

    if document.server.port == 0 {
        return Err(ConfigError::Schema {
            field: "server.port".into(),
            message: "port must be non-zero".into(),
        });
    }

    if document.providers.is_empty() {
        return Err(ConfigError::Schema {
            field: "Providers".into(),
            message: "at least one provider is required".into(),
        });
    }

    let mut seen = HashSet::new();
    let mut providers = Vec::with_capacity(document.providers.len());

    for (idx, section) in document.providers.into_iter().enumerate() {
        let field = format!("Providers[{idx}]");

        if section.name.is_empty() {
            return Err(ConfigError::Schema {
                field: format!("{field}.name"),
                message: "provider name must be non-empty".into(),
            });
        }
        if !seen.insert(section.name.clone()) {
            return Err(ConfigError::Schema {
                field: format!("{field}.name"),
                message: format!("duplicate provider name `{}`", section.name),
            });
        }

        let base_url = section.api_base_url.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url).map_err(|e| ConfigError::Schema {
            field: format!("{field}.api_base_url"),
            message: format!("not an absolute URL: {e}"),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::Schema {
                field: format!("{field}.api_base_url"),
                message: "not an absolute URL".into(),
            });
        }

        if section.models.is_empty() {
            return Err(ConfigError::Schema {
                field: format!("{field}.models"),
                message: format!("provider `{}` declares no models", section.name),
            });
        }
        let models: Vec<ModelSpec> = section
            .models
            .into_iter()
            .map(|entry| match entry {
                ModelEntry::Name(name) => ModelSpec { name, max_tokens: defaults::max_tokens() },
                ModelEntry::Detailed { name, max_tokens } => ModelSpec { name, max_tokens },
            })
            .collect();

        let credential = match (section.api_key, section.credential_ref) {
            (_, Some(reference)) => {
                // Existence only — validity is checked later, against the API.
                let file = credentials_dir.join(format!("{reference}.json"));
                if !file.is_file() {
                    return Err(ConfigError::Reference {
                        field: format!("{field}.credentialRef"),
                        message: format!(
                            "credential `{reference}` has no file at {}",
                            file.display()
                        ),
                    });
                }
                CredentialSpec::Reference(reference)
            }
            (Some(api_key), None) => CredentialSpec::Inline { api_key },
            (None, None) => {
                return Err(ConfigError::Schema {
                    field: field.clone(),
                    message: format!(
                        "provider `{}` needs either `api_key` or `credentialRef`",
                        section.name
                    ),
                });
            }
        };

        let (compat_profile, compat_options) = match section.server_compatibility {
            Some(compat) => {
                if !KNOWN_COMPAT_PROFILES.contains(&compat.profile.as_str()) {
                    return Err(ConfigError::Schema {
                        field: format!("{field}.serverCompatibility.use"),
                        message: format!("unknown compatibility profile `{}`", compat.profile),
                    });
                }
                (compat.profile, compat.options)
            }
            None => ("openai-generic".to_string(), Value::Null),
        };

        providers.push(Provider {
            name: section.name,
            base_url,
            models,
            credential,
            compat_profile,
            compat_options,
        });
    }

    // Every router entry must reference an existing provider/model pair.
    let mut routes = BTreeMap::new();
    for (route, target) in document.router {
        let field = format!("router.{route}");
        let (provider_name, model_name) = target.split_once(',').ok_or_else(|| {
            ConfigError::Reference {
                field: field.clone(),
                message: format!("expected \"<provider>,<model>\", got `{target}`"),
            }
        })?;
        let (provider_name, model_name) = (provider_name.trim(), model_name.trim());

        let provider = providers
            .iter()
            .find(|p| p.name == provider_name)
            .ok_or_else(|| ConfigError::Reference {
                field: field.clone(),
                message: format!("unknown provider `{provider_name}`"),
            })?;
        if provider.model(model_name).is_none() {
            return Err(ConfigError::Reference {
                field,
                message: format!(
                    "provider `{provider_name}` has no model `{model_name}`"
                ),
            });
        }

        routes.insert(
            route,
            RouteTarget { provider: provider_name.to_string(), model: model_name.to_string() },
        );
    }

    // Derive a default route if missing: first provider's first model.
    if !routes.contains_key("default") {
        let provider = &providers[0];
        let model = &provider.models[0];
        let message = format!(
            "no `default` route configured — derived {},{}",
            provider.name, model.name
        );
        warn!("{message}");
        warnings.push(message);
        routes.insert(
            "default".into(),
            RouteTarget { provider: provider.name.clone(), model: model.name.clone() },
        );
    }

    let server = ServerSettings {
        port: document.server.port,
        host: document.server.host,
        debug: document.server.debug,
        debug_dir: document.server.debug_dir,
    };

    Ok((providers, routes, server))
}

mod defaults {
    pub fn host() -> String { "127.0.0.1".into() }
    pub fn max_tokens() -> u64 { 8_192 }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn credentials_dir_with(refs: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for r in refs {
            std::fs::write(
                dir.path().join(format!("{r}.json")),
                r#"{"api_key": "sk-test"}"#,
            )
            .unwrap();
        }
        dir
    }

    fn two_provider_json() -> &'static str {
        r#"{
            "version": "4.0",
            "server": { "port": 3456, "host": "127.0.0.1", "debug": true },
            "Providers": [
                {
                    "name": "openrouter",
                    "api_base_url": "https://openrouter.ai/api/v1",
                    "credentialRef": "openrouter",
                    "models": [
                        { "name": "anthropic/claude-sonnet-4", "maxTokens": 64000 },
                        "anthropic/claude-haiku"
                    ]
                },
                {
                    "name": "lmstudio",
                    "api_base_url": "http://localhost:1234/v1",
                    "api_key": "lm-studio",
                    "models": [ { "name": "qwen2.5-32b", "maxTokens": 32768 } ],
                    "serverCompatibility": { "use": "lmstudio" }
                }
            ],
            "router": {
                "default": "openrouter,anthropic/claude-sonnet-4",
                "background": "lmstudio,qwen2.5-32b"
            }
        }"#
    }

    // -----------------------------------------------------------------------
    // Parsing & shapes
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_json_config() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "config.json", include_str!("../config.example.json"));
        let table = preprocess(&path, creds.path()).expect("example config should compile");
        assert_eq!(table.metadata.source_format, "json");
        assert!(table.routes.contains_key("default"));
    }

    #[test]
    fn parse_example_toml_config() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "config.toml", include_str!("../config.example.toml"));
        let table = preprocess(&path, creds.path()).expect("example config should compile");
        assert_eq!(table.metadata.source_format, "toml");
    }

    #[test]
    fn missing_file_is_config_missing() {
        let creds = credentials_dir_with(&[]);
        let err = preprocess(Path::new("/definitely/not/here.json"), creds.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "broken.json", "{ not json");
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "extra.json",
            r#"{
                "version": "4.0",
                "experimental_flag": { "anything": true },
                "server": { "port": 3456 },
                "Providers": [{
                    "name": "openrouter",
                    "api_base_url": "https://openrouter.ai/api/v1",
                    "credentialRef": "openrouter",
                    "models": ["m1"]
                }],
                "router": { "default": "openrouter,m1" }
            }"#,
        );
        assert!(preprocess(&path, creds.path()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Schema validation
    // -----------------------------------------------------------------------

    #[test]
    fn rejects_empty_provider_list() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "none.json",
            r#"{ "server": { "port": 3456 }, "Providers": [], "router": {} }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "got {err:?}");
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "dup.json",
            r#"{
                "server": { "port": 3456 },
                "Providers": [
                    { "name": "a", "api_base_url": "http://x", "api_key": "k", "models": ["m"] },
                    { "name": "a", "api_base_url": "http://y", "api_key": "k", "models": ["m"] }
                ]
            }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate provider name"));
    }

    #[test]
    fn rejects_relative_base_url() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "relurl.json",
            r#"{
                "server": { "port": 3456 },
                "Providers": [
                    { "name": "a", "api_base_url": "not-a-url", "api_key": "k", "models": ["m"] }
                ]
            }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { ref field, .. } if field.contains("api_base_url")));
    }

    #[test]
    fn rejects_provider_without_any_credential() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "nocred.json",
            r#"{
                "server": { "port": 3456 },
                "Providers": [
                    { "name": "a", "api_base_url": "http://x", "models": ["m"] }
                ]
            }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn rejects_unknown_compat_profile() {
        let creds = credentials_dir_with(&[]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "compat.json",
            r#"{
                "server": { "port": 3456 },
                "Providers": [{
                    "name": "a", "api_base_url": "http://x", "api_key": "k",
                    "models": ["m"],
                    "serverCompatibility": { "use": "no-such-profile" }
                }]
            }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("no-such-profile"));
    }

    // -----------------------------------------------------------------------
    // Reference validation
    // -----------------------------------------------------------------------

    #[test]
    fn rejects_credential_ref_without_file() {
        let creds = credentials_dir_with(&[]); // empty dir
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "ref.json",
            r#"{
                "server": { "port": 3456 },
                "Providers": [{
                    "name": "a", "api_base_url": "http://x",
                    "credentialRef": "ghost", "models": ["m"]
                }]
            }"#,
        );
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Reference { .. }), "got {err:?}");
    }

    #[test]
    fn rejects_route_to_unknown_provider() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let mut doc: Value = serde_json::from_str(two_provider_json()).unwrap();
        doc["router"]["think"] = Value::String("nonexistent,model-x".into());
        let path = write_config(dir.path(), "badroute.json", &doc.to_string());
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn rejects_route_to_unknown_model() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let mut doc: Value = serde_json::from_str(two_provider_json()).unwrap();
        doc["router"]["think"] = Value::String("openrouter,model-that-is-not-there".into());
        let path = write_config(dir.path(), "badmodel.json", &doc.to_string());
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("has no model"));
    }

    #[test]
    fn rejects_route_without_comma() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let mut doc: Value = serde_json::from_str(two_provider_json()).unwrap();
        doc["router"]["think"] = Value::String("just-a-provider".into());
        let path = write_config(dir.path(), "nocomma.json", &doc.to_string());
        let err = preprocess(&path, creds.path()).unwrap_err();
        assert!(err.to_string().contains("<provider>,<model>"));
    }

    // -----------------------------------------------------------------------
    // Normalisation
    // -----------------------------------------------------------------------

    #[test]
    fn compiles_full_table_with_order_preserved() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "full.json", two_provider_json());
        let table = preprocess(&path, creds.path()).unwrap();

        assert_eq!(table.providers.len(), 2);
        assert_eq!(table.providers[0].name, "openrouter");
        assert_eq!(table.providers[1].name, "lmstudio");
        // Model document order preserved
        assert_eq!(table.providers[0].models[0].name, "anthropic/claude-sonnet-4");
        assert_eq!(table.providers[0].models[0].max_tokens, 64000);
        assert_eq!(table.providers[0].models[1].name, "anthropic/claude-haiku");
        // Bare model names take the default budget
        assert_eq!(table.providers[0].models[1].max_tokens, 8_192);

        assert_eq!(table.providers[1].compat_profile, "lmstudio");
        assert_eq!(table.server.port, 3456);
        assert!(table.server.debug);
    }

    #[test]
    fn inline_api_key_gets_synthetic_ref() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "inline.json", two_provider_json());
        let table = preprocess(&path, creds.path()).unwrap();

        assert_eq!(table.providers[0].credential_ref(), "openrouter");
        assert_eq!(table.providers[1].credential_ref(), "inline:lmstudio");
    }

    #[test]
    fn derives_default_route_with_warning_when_missing() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let mut doc: Value = serde_json::from_str(two_provider_json()).unwrap();
        doc["router"].as_object_mut().unwrap().remove("default");
        let path = write_config(dir.path(), "nodefault.json", &doc.to_string());
        let table = preprocess(&path, creds.path()).unwrap();

        let default = &table.routes["default"];
        assert_eq!(default.provider, "openrouter");
        assert_eq!(default.model, "anthropic/claude-sonnet-4");
        assert!(table.warnings.iter().any(|w| w.contains("default")));
    }

    #[test]
    fn metadata_records_source_and_path() {
        let creds = credentials_dir_with(&["openrouter"]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "meta.json", two_provider_json());
        let table = preprocess(&path, creds.path()).unwrap();

        assert_eq!(table.metadata.source_format, "json");
        assert_eq!(table.metadata.config_path, path);
    }
}
