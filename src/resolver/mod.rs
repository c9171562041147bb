//! Domain resolution: pure derivation of per-domain deployment configuration
//! from a domain name, plus format validation and prerequisite checks.
//!
//! Resolution is deterministic and side-effect free; results are cached by
//! domain name. Validation distinguishes fatal issues (malformed names) from
//! warnings (missing credentials, loopback literals, root-domain guesses
//! without a public-suffix list).

use crate::environment::Environment;
use crate::errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::sync::Mutex;

/// RFC-1035-shaped hostname: lowercase labels, at least two of them.
static DOMAIN_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .expect("domain regex is valid")
});

/// Environment variables consulted by prerequisite validation. Missing values
/// warn before deployment; the phases that need them fail later with a
/// credential error.
pub const CREDENTIAL_ENV_VARS: [&str; 3] = [
    "CLOUDFLARE_API_TOKEN",
    "CLOUDFLARE_ACCOUNT_ID",
    "CLOUDFLARE_ZONE_ID",
];

/// Per-environment URL set for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentUrls {
    pub production: String,
    pub staging: String,
    pub development: String,
}

impl EnvironmentUrls {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            production: format!("https://{domain}"),
            staging: format!("https://staging.{domain}"),
            development: format!("https://dev.{domain}"),
        }
    }

    pub fn get(&self, environment: Environment) -> &str {
        match environment {
            Environment::Production => &self.production,
            Environment::Staging => &self.staging,
            Environment::Development => &self.development,
        }
    }
}

/// A managed database referenced by a domain, possibly shared with others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDatabase {
    pub name: String,
    pub environment: Environment,
    /// Domains that consume this database in addition to the owner.
    #[serde(default)]
    pub shared_with: Vec<String>,
}

/// Derived, immutable per-domain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    /// Lowercase alphanumerics and hyphens derived from `name`.
    pub clean_name: String,
    /// Worker service name; `{clean_name}-data-service` unless overridden.
    pub worker_name: String,
    /// Database name override; the database phase derives
    /// `{clean_name}-{environment}-db` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    pub environments: EnvironmentUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    /// Domains that must deploy before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Allowed CORS origins per environment.
    #[serde(default)]
    pub cors_origins: BTreeMap<Environment, Vec<String>>,
    #[serde(default)]
    pub shared_databases: Vec<SharedDatabase>,
}

/// Optional per-domain overrides, typically loaded from `armada.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainOverrides {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub cors_origins: BTreeMap<Environment, Vec<String>>,
    #[serde(default)]
    pub shared_databases: Vec<SharedDatabase>,
}

/// Outcome of `validate_prerequisites`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrereqReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Resolves domain names into `DomainConfig`s, caching results.
pub struct DomainResolver {
    overrides: HashMap<String, DomainOverrides>,
    /// Public-suffix entries (e.g. `co.uk`). Empty means root-domain
    /// splitting falls back to the last two labels and warns.
    public_suffixes: Vec<String>,
    cache: Mutex<HashMap<String, DomainConfig>>,
}

impl DomainResolver {
    pub fn new(overrides: HashMap<String, DomainOverrides>, public_suffixes: Vec<String>) -> Self {
        Self {
            overrides,
            public_suffixes,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Derive the cleaned name: lowercase, alphanumerics preserved, runs of
    /// anything else collapsed to a single hyphen.
    pub fn clean_name(domain: &str) -> String {
        let mut out = String::with_capacity(domain.len());
        let mut last_hyphen = true;
        for c in domain.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_hyphen = false;
            } else if !last_hyphen {
                out.push('-');
                last_hyphen = true;
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        out
    }

    /// Resolve a domain into its deployment configuration. Idempotent and
    /// cached; two calls for the same domain return identical configs.
    pub fn resolve(&self, domain: &str) -> Result<DomainConfig, OrchestratorError> {
        if let Some(hit) = self.cache.lock().expect("resolver cache lock").get(domain) {
            return Ok(hit.clone());
        }

        let issues = self.format_issues(domain);
        if !issues.is_empty() {
            return Err(OrchestratorError::Validation(issues.join("; ")));
        }

        let clean = Self::clean_name(domain);
        let overrides = self.overrides.get(domain).cloned().unwrap_or_default();
        let config = DomainConfig {
            name: domain.to_string(),
            worker_name: overrides
                .worker_name
                .unwrap_or_else(|| format!("{clean}-data-service")),
            database_name: overrides.database_name,
            environments: EnvironmentUrls::for_domain(domain),
            zone_id: overrides.zone_id,
            dependencies: overrides.dependencies,
            cors_origins: overrides.cors_origins,
            shared_databases: overrides.shared_databases,
            clean_name: clean,
        };

        debug_assert!(
            config
                .worker_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "worker_name must stay within [a-z0-9-]"
        );

        self.cache
            .lock()
            .expect("resolver cache lock")
            .insert(domain.to_string(), config.clone());
        Ok(config)
    }

    /// Resolve a list of domains. Stops at the first malformed name.
    pub fn resolve_many(
        &self,
        domains: &[String],
    ) -> Result<BTreeMap<String, DomainConfig>, OrchestratorError> {
        let mut out = BTreeMap::new();
        for domain in domains {
            out.insert(domain.clone(), self.resolve(domain)?);
        }
        Ok(out)
    }

    /// Check deployability prerequisites for a domain. Malformed names are
    /// issues; missing credentials and loopback literals are warnings.
    pub fn validate_prerequisites(&self, domain: &str) -> PrereqReport {
        let mut report = PrereqReport {
            valid: true,
            ..Default::default()
        };

        if is_loopback_literal(domain) {
            report
                .warnings
                .push(format!("'{domain}' is a loopback literal; deployments will not be routable"));
        } else {
            report.issues = self.format_issues(domain);
            if !report.issues.is_empty() {
                report.valid = false;
            }
        }

        for var in CREDENTIAL_ENV_VARS {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                report
                    .warnings
                    .push(format!("{var} is not set; platform calls may fail"));
            }
        }

        if self.public_suffixes.is_empty() && domain.matches('.').count() >= 3 {
            report.warnings.push(format!(
                "no public-suffix list configured; root domain of '{domain}' is derived from the last two labels"
            ));
        }

        report
    }

    /// Root domain used for zone naming: the registered suffix plus one
    /// label. Without a configured public-suffix list this falls back to the
    /// last two labels.
    pub fn root_domain(&self, domain: &str) -> String {
        let best = self
            .public_suffixes
            .iter()
            .filter(|suffix| {
                domain.ends_with(&format!(".{suffix}")) || domain == suffix.as_str()
            })
            .max_by_key(|suffix| suffix.len());

        if let Some(suffix) = best {
            let prefix = &domain[..domain.len() - suffix.len() - 1];
            return match prefix.rsplit('.').next() {
                Some(label) => format!("{label}.{suffix}"),
                None => suffix.clone(),
            };
        }

        let labels: Vec<&str> = domain.rsplitn(3, '.').collect();
        if labels.len() >= 2 {
            format!("{}.{}", labels[1], labels[0])
        } else {
            domain.to_string()
        }
    }

    fn format_issues(&self, domain: &str) -> Vec<String> {
        let mut issues = Vec::new();
        if !domain.is_ascii() {
            issues.push(format!(
                "'{domain}' contains non-ASCII characters; internationalized domain names are not accepted"
            ));
            return issues;
        }
        if !DOMAIN_RE.is_match(domain) {
            issues.push(format!(
                "'{domain}' is not a valid domain name (expected lowercase dotted labels)"
            ));
        }
        issues
    }
}

/// Cheap format check without resolving.
pub fn is_valid_domain(domain: &str) -> bool {
    domain.is_ascii() && DOMAIN_RE.is_match(domain)
}

fn is_loopback_literal(domain: &str) -> bool {
    domain == "localhost"
        || domain == "127.0.0.1"
        || domain == "::1"
        || domain.ends_with(".localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DomainResolver {
        DomainResolver::new(HashMap::new(), Vec::new())
    }

    #[test]
    fn clean_name_strips_dots_and_case() {
        assert_eq!(DomainResolver::clean_name("api.example.com"), "api-example-com");
        assert_eq!(DomainResolver::clean_name("My-Shop.example.co"), "my-shop-example-co");
        assert_eq!(DomainResolver::clean_name("a..b."), "a-b");
    }

    #[test]
    fn resolve_derives_defaults() {
        let config = resolver().resolve("api.example.com").unwrap();
        assert_eq!(config.clean_name, "api-example-com");
        assert_eq!(config.worker_name, "api-example-com-data-service");
        assert_eq!(config.database_name, None);
        assert_eq!(config.environments.production, "https://api.example.com");
        assert_eq!(config.environments.staging, "https://staging.api.example.com");
        assert_eq!(config.environments.development, "https://dev.api.example.com");
    }

    #[test]
    fn resolve_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "api.example.com".to_string(),
            DomainOverrides {
                worker_name: Some("edge-api".to_string()),
                database_name: Some("api-primary".to_string()),
                zone_id: Some("0123456789abcdef0123456789abcdef".to_string()),
                dependencies: vec!["auth.example.com".to_string()],
                ..Default::default()
            },
        );
        let resolver = DomainResolver::new(overrides, Vec::new());
        let config = resolver.resolve("api.example.com").unwrap();
        assert_eq!(config.worker_name, "edge-api");
        assert_eq!(config.database_name.as_deref(), Some("api-primary"));
        assert_eq!(config.dependencies, vec!["auth.example.com"]);
    }

    #[test]
    fn resolve_is_cached_and_idempotent() {
        let resolver = resolver();
        let first = resolver.resolve("api.example.com").unwrap();
        let second = resolver.resolve("api.example.com").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_rejects_malformed_domains() {
        let resolver = resolver();
        assert!(resolver.resolve("no-dots").is_err());
        assert!(resolver.resolve("UPPER.example.com").is_err());
        assert!(resolver.resolve("-bad.example.com").is_err());
        assert!(resolver.resolve("").is_err());
    }

    #[test]
    fn resolve_rejects_idn() {
        let err = resolver().resolve("münchen.example.de").unwrap_err();
        assert!(err.to_string().contains("internationalized"));
    }

    #[test]
    fn prerequisites_flag_malformed_as_issue() {
        let report = resolver().validate_prerequisites("Bad_Domain");
        assert!(!report.valid);
        assert!(!report.issues.is_empty());
    }

    #[test]
    fn prerequisites_loopback_warns_but_passes() {
        let report = resolver().validate_prerequisites("localhost");
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("loopback")));
        let report = resolver().validate_prerequisites("127.0.0.1");
        assert!(report.valid);
    }

    #[test]
    fn prerequisites_warn_on_deep_domains_without_suffix_list() {
        let report = resolver().validate_prerequisites("api.shop.example.co.uk");
        assert!(report.warnings.iter().any(|w| w.contains("public-suffix")));
    }

    #[test]
    fn root_domain_defaults_to_last_two_labels() {
        let r = resolver();
        assert_eq!(r.root_domain("api.example.com"), "example.com");
        assert_eq!(r.root_domain("example.com"), "example.com");
    }

    #[test]
    fn root_domain_honors_public_suffixes() {
        let r = DomainResolver::new(HashMap::new(), vec!["co.uk".to_string()]);
        assert_eq!(r.root_domain("api.shop.example.co.uk"), "example.co.uk");
        assert_eq!(r.root_domain("example.co.uk"), "example.co.uk");
    }

    #[test]
    fn resolve_many_returns_all() {
        let resolver = resolver();
        let map = resolver
            .resolve_many(&["a.example.com".to_string(), "b.example.com".to_string()])
            .unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("a.example.com"));
    }
}
