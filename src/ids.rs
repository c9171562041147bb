//! Deterministic identifier generation for orchestration runs and per-domain
//! deployments.
//!
//! Identifiers embed a wall-clock timestamp (ISO8601 with `:` and `.`
//! replaced by `-` so they stay filesystem-safe) plus a random hex nonce
//! drawn from a cryptographically random source. Both forms parse back into
//! their structural components for audit tooling.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

const ORCHESTRATION_PREFIX: &str = "orchestration";
const DEPLOYMENT_PREFIX: &str = "deploy";

static DEPLOYMENT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^deploy-(?P<domain>.+)-(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z)-(?P<nonce>[0-9a-f]{8})$",
    )
    .expect("deployment id regex is valid")
});

static ORCHESTRATION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^orchestration-(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z)-(?P<nonce>[0-9a-f]{12})$",
    )
    .expect("orchestration id regex is valid")
});

/// Structural components of a parsed identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    /// Domain portion (empty for orchestration ids).
    pub domain: String,
    /// Embedded wall-clock timestamp.
    pub timestamp: DateTime<Utc>,
    /// Random hex nonce.
    pub nonce: String,
}

fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn parse_timestamp_slug(slug: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(slug, "%Y-%m-%dT%H-%M-%S-%3fZ")
        .ok()
        .map(|naive| naive.and_utc())
}

fn random_hex(len: usize) -> String {
    // Uuid v4 carries 122 random bits from the OS entropy source; the simple
    // form is 32 hex chars, plenty for both nonce widths.
    Uuid::new_v4().simple().to_string()[..len].to_string()
}

/// Generate an orchestration run identifier for the given moment.
pub fn orchestration_id_at(at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        ORCHESTRATION_PREFIX,
        timestamp_slug(at),
        random_hex(12)
    )
}

/// Generate an orchestration run identifier at the current wall clock.
pub fn orchestration_id() -> String {
    orchestration_id_at(Utc::now())
}

/// Generate a per-domain deployment identifier for the given moment.
pub fn deployment_id_at(domain: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}-{}",
        DEPLOYMENT_PREFIX,
        domain,
        timestamp_slug(at),
        random_hex(8)
    )
}

/// Generate a per-domain deployment identifier at the current wall clock.
pub fn deployment_id(domain: &str) -> String {
    deployment_id_at(domain, Utc::now())
}

/// Parse an orchestration id back into its components.
pub fn parse_orchestration_id(id: &str) -> Option<ParsedId> {
    let caps = ORCHESTRATION_ID_RE.captures(id)?;
    Some(ParsedId {
        domain: String::new(),
        timestamp: parse_timestamp_slug(&caps["ts"])?,
        nonce: caps["nonce"].to_string(),
    })
}

/// Parse a deployment id back into its components.
pub fn parse_deployment_id(id: &str) -> Option<ParsedId> {
    let caps = DEPLOYMENT_ID_RE.captures(id)?;
    Some(ParsedId {
        domain: caps["domain"].to_string(),
        timestamp: parse_timestamp_slug(&caps["ts"])?,
        nonce: caps["nonce"].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_moment() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 34, 56).unwrap()
    }

    #[test]
    fn orchestration_id_shape() {
        let id = orchestration_id_at(fixed_moment());
        assert!(id.starts_with("orchestration-2026-08-01T12-34-56-000Z-"));
        assert!(!id.contains(':'));
        assert!(!id.contains('.'));
    }

    #[test]
    fn orchestration_id_round_trips() {
        let id = orchestration_id_at(fixed_moment());
        let parsed = parse_orchestration_id(&id).expect("id must parse");
        assert_eq!(parsed.timestamp, fixed_moment());
        assert_eq!(parsed.nonce.len(), 12);
        assert!(parsed.domain.is_empty());
    }

    #[test]
    fn deployment_id_round_trips_with_dotted_domain() {
        let id = deployment_id_at("api.example.com", fixed_moment());
        let parsed = parse_deployment_id(&id).expect("id must parse");
        assert_eq!(parsed.domain, "api.example.com");
        assert_eq!(parsed.timestamp, fixed_moment());
        assert_eq!(parsed.nonce.len(), 8);
    }

    #[test]
    fn deployment_id_round_trips_with_hyphenated_domain() {
        // Domains may contain hyphens; the parser must anchor on the
        // timestamp rather than splitting naively.
        let id = deployment_id_at("my-shop.example.co", fixed_moment());
        let parsed = parse_deployment_id(&id).expect("id must parse");
        assert_eq!(parsed.domain, "my-shop.example.co");
    }

    #[test]
    fn ids_are_unique_at_the_same_instant() {
        let at = fixed_moment();
        let a = orchestration_id_at(at);
        let b = orchestration_id_at(at);
        assert_ne!(a, b);
        let c = deployment_id_at("x.example.com", at);
        let d = deployment_id_at("x.example.com", at);
        assert_ne!(c, d);
    }

    #[test]
    fn malformed_ids_do_not_parse() {
        assert!(parse_orchestration_id("orchestration-garbage").is_none());
        assert!(parse_deployment_id("deploy-x").is_none());
        assert!(parse_deployment_id("orchestration-2026-08-01T12-34-56-000Z-abcdef012345").is_none());
    }
}
