//! Provider catalog: the closed set of third-party data providers credentials
//! can be registered for, with per-field validation rules.
//!
//! The catalog is versioned JSON. Every descriptor is checked when it is
//! loaded (patterns compile, URLs parse, bounds are consistent, names are
//! unique) so registration never meets a broken rule at runtime.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use url::Url;

use crate::secrets::{Credentials, FieldIssue, VaultError};

/// Current catalog format version.
pub const CATALOG_VERSION: u32 = 1;

/// Provider used by the built-in catalog for the Korean food safety API.
pub const FOOD_SAFETY_KOREA: &str = "food_safety_korea";

/// Provider used by the built-in catalog for the Korean exercise API.
pub const K_HEALTH_EXERCISE: &str = "k_health_exercise";

/// Generic API-key provider with permissive rules.
pub const GENERIC_API_KEY: &str = "generic_api_key";

const MIN_SECRET_LENGTH: usize = 8;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read provider catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid provider catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported catalog version {0} (expected {expected})", expected = CATALOG_VERSION)]
    Version(u32),

    #[error("Provider {provider}: {message}")]
    InvalidProvider { provider: String, message: String },

    #[error("Duplicate provider name: {0}")]
    Duplicate(String),
}

fn invalid(provider: &str, message: impl Into<String>) -> CatalogError {
    CatalogError::InvalidProvider {
        provider: provider.to_string(),
        message: message.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field rules
// ─────────────────────────────────────────────────────────────────────────────

/// Validation rule for one credential field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Regex the whole value must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl FieldRule {
    pub fn new(min_length: usize, max_length: usize) -> Self {
        Self {
            min_length: Some(min_length),
            max_length: Some(max_length),
            ..Self::default()
        }
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self.compiled = None;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn prepare(&mut self, provider: &str, field: &str) -> Result<(), CatalogError> {
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(invalid(
                    provider,
                    format!("{}: min_length {} exceeds max_length {}", field, min, max),
                ));
            }
        }
        self.compiled = match &self.pattern {
            Some(pattern) => Some(Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                invalid(provider, format!("{}: invalid pattern: {}", field, e))
            })?),
            None => None,
        };
        Ok(())
    }

    fn check(&self, field: &str, value: &str, errors: &mut Vec<FieldIssue>) {
        let len = value.chars().count();
        let hint = self
            .description
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        if let Some(min) = self.min_length {
            if len < min {
                errors.push(FieldIssue::new(
                    field,
                    format!("must be at least {} characters, got {}{}", min, len, hint),
                ));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                errors.push(FieldIssue::new(
                    field,
                    format!("must be at most {} characters, got {}{}", max, len, hint),
                ));
            }
        }
        if let Some(re) = &self.compiled {
            if !re.is_match(value) {
                errors.push(FieldIssue::new(field, format!("has an invalid format{}", hint)));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth schemes
// ─────────────────────────────────────────────────────────────────────────────

/// Authentication scheme and its required fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    ApiKey {
        api_key: FieldRule,
    },
    #[serde(rename = "oauth")]
    OAuth {
        client_id: FieldRule,
        client_secret: FieldRule,
    },
    BasicAuth {
        username: FieldRule,
        password: FieldRule,
    },
    BearerToken {
        token: FieldRule,
    },
}

impl AuthScheme {
    pub fn id(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "api_key",
            Self::OAuth { .. } => "oauth",
            Self::BasicAuth { .. } => "basic_auth",
            Self::BearerToken { .. } => "bearer_token",
        }
    }

    /// Required fields with their rules.
    pub fn required_fields(&self) -> Vec<(&'static str, &FieldRule)> {
        match self {
            Self::ApiKey { api_key } => vec![("api_key", api_key)],
            Self::OAuth {
                client_id,
                client_secret,
            } => vec![("client_id", client_id), ("client_secret", client_secret)],
            Self::BasicAuth { username, password } => {
                vec![("username", username), ("password", password)]
            }
            Self::BearerToken { token } => vec![("token", token)],
        }
    }

    fn required_fields_mut(&mut self) -> Vec<(&'static str, &mut FieldRule)> {
        match self {
            Self::ApiKey { api_key } => vec![("api_key", api_key)],
            Self::OAuth {
                client_id,
                client_secret,
            } => vec![("client_id", client_id), ("client_secret", client_secret)],
            Self::BasicAuth { username, password } => {
                vec![("username", username), ("password", password)]
            }
            Self::BearerToken { token } => vec![("token", token)],
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of validating a credential map against a descriptor.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<FieldIssue>,
    pub warnings: Vec<FieldIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors become a `Validation` error; otherwise the warnings are returned.
    pub fn into_result(self) -> Result<Vec<FieldIssue>, VaultError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(VaultError::invalid_fields(self.errors))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Stable identifier, e.g. `food_safety_korea`
    pub name: String,
    pub display_name: String,
    pub base_url: String,
    /// Path appended to `base_url` for connectivity checks
    #[serde(default)]
    pub test_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    pub auth: AuthScheme,
    #[serde(default)]
    pub optional_fields: BTreeMap<String, FieldRule>,
    /// e.g. `{"requests_per_minute": 60}`
    #[serde(default)]
    pub rate_limits: BTreeMap<String, u32>,
}

impl ProviderDescriptor {
    fn prepare(&mut self) -> Result<(), CatalogError> {
        let name = self.name.clone();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid(&name, "name must be lowercase [a-z0-9_]"));
        }
        let url = Url::parse(&self.base_url)
            .map_err(|e| invalid(&name, format!("invalid base_url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(
                &name,
                format!("base_url must use http or https, got {}", url.scheme()),
            ));
        }
        if url.host_str().is_none() {
            return Err(invalid(&name, "base_url has no host"));
        }
        if let Some(doc) = &self.documentation_url {
            Url::parse(doc)
                .map_err(|e| invalid(&name, format!("invalid documentation_url: {}", e)))?;
        }

        let mut required: Vec<&'static str> = Vec::new();
        for (field, rule) in self.auth.required_fields_mut() {
            rule.prepare(&name, field)?;
            required.push(field);
        }
        for (field, rule) in self.optional_fields.iter_mut() {
            if required.contains(&field.as_str()) {
                return Err(invalid(
                    &name,
                    format!("{} is both required and optional", field),
                ));
            }
            rule.prepare(&name, field)?;
        }
        Ok(())
    }

    pub fn auth_type(&self) -> &'static str {
        self.auth.id()
    }

    /// Full URL probed by connectivity checks.
    pub fn test_url(&self) -> String {
        if self.test_endpoint.is_empty() {
            return self.base_url.clone();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.test_endpoint.trim_start_matches('/')
        )
    }

    pub fn is_known_field(&self, field: &str) -> bool {
        self.auth.required_fields().iter().any(|(f, _)| *f == field)
            || self.optional_fields.contains_key(field)
    }

    /// Check required/optional fields, lengths and patterns, plus advisory warnings.
    pub fn validate(&self, credentials: &Credentials) -> ValidationReport {
        let mut report = ValidationReport::default();

        for (field, rule) in self.auth.required_fields() {
            match credentials.get(field) {
                None | Some("") => report
                    .errors
                    .push(FieldIssue::new(field, "required field is missing")),
                Some(value) => rule.check(field, value, &mut report.errors),
            }
        }

        for (field, value) in credentials.iter() {
            if let Some(rule) = self.optional_fields.get(field) {
                if !value.is_empty() {
                    rule.check(field, value, &mut report.errors);
                }
            } else if !self.is_known_field(field) {
                report
                    .warnings
                    .push(FieldIssue::new(field, "unknown field for this provider"));
            }
        }

        self.scheme_checks(credentials, &mut report);
        security_warnings(credentials, &mut report.warnings);
        report
    }

    fn scheme_checks(&self, credentials: &Credentials, report: &mut ValidationReport) {
        match &self.auth {
            AuthScheme::BearerToken { .. } => {
                if credentials
                    .get("token")
                    .is_some_and(|t| t.starts_with("Bearer "))
                {
                    report.warnings.push(FieldIssue::new(
                        "token",
                        "includes a 'Bearer ' prefix; store the token value only",
                    ));
                }
            }
            AuthScheme::OAuth { .. } => {
                if let Some(token) = credentials.get("access_token").filter(|t| !t.is_empty()) {
                    if let Some(problem) = jwt_shape_problem(token) {
                        report
                            .errors
                            .push(FieldIssue::new("access_token", problem));
                    }
                }
            }
            _ => {}
        }
    }

    /// Per-entry configuration defaults merged with caller overrides.
    pub fn default_configuration(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut config = serde_json::Map::new();
        config.insert("timeout".into(), serde_json::json!(30));
        config.insert("retry_count".into(), serde_json::json!(3));
        config.insert("rate_limit".into(), serde_json::json!(self.rate_limits));
        config.insert("auto_test".into(), serde_json::json!(true));
        config
    }
}

fn jwt_shape_problem(token: &str) -> Option<&'static str> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Some("JWT must have three dot-separated parts");
    }
    for part in &parts[..2] {
        if URL_SAFE_NO_PAD.decode(part.trim_end_matches('=')).is_err() {
            return Some("JWT header or payload is not valid base64url");
        }
    }
    None
}

fn security_warnings(credentials: &Credentials, warnings: &mut Vec<FieldIssue>) {
    const SECRET_FIELDS: [&str; 4] = ["password", "secret", "api_key", "client_secret"];
    const WEAK_PREFIXES: [&str; 4] = ["password", "123456", "admin", "test"];

    for (field, value) in credentials.iter() {
        if value.is_empty() || !SECRET_FIELDS.contains(&field) {
            continue;
        }
        if value.chars().count() < MIN_SECRET_LENGTH {
            warnings.push(FieldIssue::new(
                field,
                format!("shorter than {} characters", MIN_SECRET_LENGTH),
            ));
        }
        if matches!(field, "password" | "secret" | "client_secret") {
            let lower = value.to_lowercase();
            let weak = WEAK_PREFIXES.iter().any(|prefix| {
                lower
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
            });
            if weak {
                warnings.push(FieldIssue::new(field, "matches a weak password pattern"));
            }
        }
    }
}

/// Partially reveal a secret for display: `AB****yz`.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(8);
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    providers: Vec<ProviderDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    providers: BTreeMap<String, ProviderDescriptor>,
}

impl ProviderCatalog {
    pub fn from_descriptors(descriptors: Vec<ProviderDescriptor>) -> Result<Self, CatalogError> {
        let mut providers = BTreeMap::new();
        for mut descriptor in descriptors {
            descriptor.prepare()?;
            if providers.contains_key(&descriptor.name) {
                return Err(CatalogError::Duplicate(descriptor.name));
            }
            providers.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { providers })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        if file.version != CATALOG_VERSION {
            return Err(CatalogError::Version(file.version));
        }
        Self::from_descriptors(file.providers)
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(
            path = %path.display(),
            providers = catalog.providers.len(),
            "Loaded provider catalog"
        );
        Ok(catalog)
    }

    /// Built-in descriptors for the supported food and exercise APIs.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_descriptors(vec![
            ProviderDescriptor {
                name: FOOD_SAFETY_KOREA.to_string(),
                display_name: "Food Safety Korea (MFDS)".to_string(),
                base_url: "https://openapi.foodsafetykorea.go.kr/api".to_string(),
                test_endpoint: "I2790/json/1/1".to_string(),
                documentation_url: Some(
                    "https://www.foodsafetykorea.go.kr/api/openApiInfo.do".to_string(),
                ),
                auth: AuthScheme::ApiKey {
                    api_key: FieldRule::new(20, 50)
                        .with_pattern(r"^[A-Za-z0-9]+$")
                        .with_description("20-50 alphanumeric characters"),
                },
                optional_fields: BTreeMap::new(),
                rate_limits: BTreeMap::from([("requests_per_day".to_string(), 1000)]),
            },
            ProviderDescriptor {
                name: K_HEALTH_EXERCISE.to_string(),
                display_name: "Korea Health Promotion Institute Exercise".to_string(),
                base_url: "https://openapi.k-health.or.kr/api".to_string(),
                test_endpoint: "exercise/categories".to_string(),
                documentation_url: None,
                auth: AuthScheme::ApiKey {
                    api_key: FieldRule::new(15, 40)
                        .with_pattern(r"^[A-Za-z0-9\-_]+$")
                        .with_description("15-40 characters of letters, digits, '-' or '_'"),
                },
                optional_fields: BTreeMap::new(),
                rate_limits: BTreeMap::from([("requests_per_minute".to_string(), 60)]),
            },
            ProviderDescriptor {
                name: GENERIC_API_KEY.to_string(),
                display_name: "Generic API key".to_string(),
                base_url: "https://example.com/api".to_string(),
                test_endpoint: String::new(),
                documentation_url: None,
                auth: AuthScheme::ApiKey {
                    api_key: FieldRule::new(8, 100)
                        .with_pattern(r"^[A-Za-z0-9\-_\.]+$")
                        .with_description("8-100 characters of letters, digits, '-', '_' or '.'"),
                },
                optional_fields: BTreeMap::new(),
                rate_limits: BTreeMap::new(),
            },
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(name)
    }

    /// Descriptor by name, or a `Validation` error for unknown providers.
    pub fn require(&self, name: &str) -> Result<&ProviderDescriptor, VaultError> {
        self.get(name).ok_or_else(|| {
            VaultError::invalid_fields(vec![FieldIssue::new(
                "provider",
                format!(
                    "unknown provider '{}'; expected one of: {}",
                    name,
                    self.names().join(", ")
                ),
            )])
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ProviderCatalog {
        ProviderCatalog::builtin().unwrap()
    }

    #[test]
    fn test_builtin_catalog() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        let fsk = catalog.get(FOOD_SAFETY_KOREA).unwrap();
        assert_eq!(fsk.auth_type(), "api_key");
        assert_eq!(
            fsk.test_url(),
            "https://openapi.foodsafetykorea.go.kr/api/I2790/json/1/1"
        );
    }

    #[test]
    fn test_food_safety_key_rules() {
        let fsk = catalog().get(FOOD_SAFETY_KOREA).cloned().unwrap();

        let ok = Credentials::new().with("api_key", "ABCDEFGHIJ0123456789");
        assert!(fsk.validate(&ok).is_valid());

        let short = Credentials::new().with("api_key", "ABCDE");
        let report = fsk.validate(&short);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].field, "api_key");

        let symbols = Credentials::new().with("api_key", "ABCDEFGHIJ01234567-!");
        assert!(!fsk.validate(&symbols).is_valid());

        let missing = Credentials::new().with("token", "x");
        let report = fsk.validate(&missing);
        assert!(!report.is_valid());
        assert!(report.warnings.iter().any(|w| w.field == "token"));
    }

    #[test]
    fn test_k_health_allows_dash_and_underscore() {
        let kh = catalog().get(K_HEALTH_EXERCISE).cloned().unwrap();
        let creds = Credentials::new().with("api_key", "kh-exercise_key-01");
        assert!(kh.validate(&creds).is_valid());
    }

    #[test]
    fn test_into_result() {
        let fsk = catalog().get(FOOD_SAFETY_KOREA).cloned().unwrap();
        let err = fsk
            .validate(&Credentials::new().with("api_key", "short"))
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Validation { ref issues, .. } if issues[0].field == "api_key"
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let err = catalog().require("nope").unwrap_err();
        assert!(err.to_string().contains("food_safety_korea"));
    }

    #[test]
    fn test_catalog_from_json_with_all_schemes() {
        let json = r#"{
            "version": 1,
            "providers": [
                {"name": "acme_oauth", "display_name": "Acme", "base_url": "https://acme.test/api",
                 "auth": {"type": "oauth",
                          "client_id": {"min_length": 8, "max_length": 100},
                          "client_secret": {"min_length": 16, "max_length": 200}},
                 "optional_fields": {"access_token": {}}},
                {"name": "acme_basic", "display_name": "Acme Basic", "base_url": "http://acme.test",
                 "auth": {"type": "basic_auth",
                          "username": {"min_length": 1, "max_length": 100,
                                       "pattern": "^[A-Za-z0-9@.\\-_]+$"},
                          "password": {"min_length": 1, "max_length": 200}}},
                {"name": "acme_bearer", "display_name": "Acme Bearer",
                 "base_url": "https://acme.test",
                 "auth": {"type": "bearer_token", "token": {"min_length": 10}}}
            ]
        }"#;
        let catalog = ProviderCatalog::from_json(json).unwrap();
        assert_eq!(catalog.names(), vec!["acme_basic", "acme_bearer", "acme_oauth"]);

        let bearer = catalog.get("acme_bearer").unwrap();
        let report = bearer.validate(&Credentials::new().with("token", "Bearer abc.def.ghi"));
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.message.contains("Bearer")));

        let basic = catalog.get("acme_basic").unwrap();
        let report = basic.validate(
            &Credentials::new()
                .with("username", "me@acme.test")
                .with("password", "password123"),
        );
        assert!(report.is_valid());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.field == "password" && w.message.contains("weak")));

        let oauth = catalog.get("acme_oauth").unwrap();
        let report = oauth.validate(
            &Credentials::new()
                .with("client_id", "client-0001")
                .with("client_secret", "s3cr3t-s3cr3t-s3cr3t")
                .with("access_token", "not-a-jwt"),
        );
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].field, "access_token");
    }

    #[test]
    fn test_patterns_match_whole_value() {
        let json = r#"{
            "version": 1,
            "providers": [
                {"name": "digits_only", "display_name": "Digits", "base_url": "https://digits.test",
                 "auth": {"type": "api_key", "api_key": {"pattern": "[0-9]+"}}}
            ]
        }"#;
        let catalog = ProviderCatalog::from_json(json).unwrap();
        let provider = catalog.get("digits_only").unwrap();

        assert!(provider
            .validate(&Credentials::new().with("api_key", "0123456789"))
            .is_valid());
        let report = provider.validate(&Credentials::new().with("api_key", "abc123xyz"));
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].field, "api_key");
    }

    #[test]
    fn test_catalog_load_time_checks() {
        let bad_pattern = r#"{"version": 1, "providers": [
            {"name": "x", "display_name": "X", "base_url": "https://x.test",
             "auth": {"type": "api_key", "api_key": {"pattern": "([a-z"}}}]}"#;
        assert!(matches!(
            ProviderCatalog::from_json(bad_pattern),
            Err(CatalogError::InvalidProvider { .. })
        ));

        let bad_scheme = r#"{"version": 1, "providers": [
            {"name": "x", "display_name": "X", "base_url": "ftp://x.test",
             "auth": {"type": "api_key", "api_key": {}}}]}"#;
        assert!(ProviderCatalog::from_json(bad_scheme).is_err());

        let bad_bounds = r#"{"version": 1, "providers": [
            {"name": "x", "display_name": "X", "base_url": "https://x.test",
             "auth": {"type": "api_key", "api_key": {"min_length": 10, "max_length": 5}}}]}"#;
        assert!(ProviderCatalog::from_json(bad_bounds).is_err());

        let duplicate = r#"{"version": 1, "providers": [
            {"name": "x", "display_name": "X", "base_url": "https://x.test",
             "auth": {"type": "api_key", "api_key": {}}},
            {"name": "x", "display_name": "X2", "base_url": "https://x.test",
             "auth": {"type": "api_key", "api_key": {}}}]}"#;
        assert!(matches!(
            ProviderCatalog::from_json(duplicate),
            Err(CatalogError::Duplicate(_))
        ));

        let version = r#"{"version": 2, "providers": []}"#;
        assert!(matches!(
            ProviderCatalog::from_json(version),
            Err(CatalogError::Version(2))
        ));
    }

    #[test]
    fn test_short_secret_warning() {
        let generic = catalog().get(GENERIC_API_KEY).cloned().unwrap();
        let report = generic.validate(&Credentials::new().with("api_key", "abcdefg"));
        assert!(!report.is_valid());
        assert!(report.warnings.iter().any(|w| w.message.contains("shorter")));
    }

    #[test]
    fn test_default_configuration() {
        let fsk = catalog().get(FOOD_SAFETY_KOREA).cloned().unwrap();
        let config = fsk.default_configuration();
        assert_eq!(config["timeout"], 30);
        assert_eq!(config["retry_count"], 3);
        assert_eq!(config["auto_test"], true);
        assert_eq!(config["rate_limit"]["requests_per_day"], 1000);
    }

    #[test]
    fn test_mask_value() {
        assert_eq!(mask_value("ABCDEFGHIJ0123456789"), "AB****89");
        assert_eq!(mask_value("short"), "********");
    }
}
