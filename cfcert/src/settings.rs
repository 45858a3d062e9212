use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use documented::DocumentedFields;
use thiserror::Error;

pub const DEFAULT_WORKDIR: &str = "/etc/letsencrypt";
pub const DEFAULT_PROPAGATION_SECONDS: u64 = 10;
pub const DEFAULT_RENEW_DAYS_BEFORE: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("DOMAIN is required\nSet it via -d/--domain argument or in .env file")]
    MissingDomain,

    #[error("EMAIL is required\nSet it via -e/--email argument or in .env file")]
    MissingEmail,

    #[error(
        "CLOUDFLARE_API_TOKEN is required\n\n\
         Please set it in one of these ways:\n\
         1. Create a .env file with: CLOUDFLARE_API_TOKEN=your_token\n\
         2. Export it: export CLOUDFLARE_API_TOKEN=your_token"
    )]
    MissingApiToken,

    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),

    #[error("invalid value for {key}: {value:?} is not a non-negative integer")]
    InvalidNumber { key: &'static str, value: String },
}

/// Values given on the command line. `None` falls through to the env file.
#[derive(Debug, Clone, Default)]
pub struct SettingsArgs {
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub zone_id: Option<String>,
    pub staging: bool,
    pub propagation_seconds: Option<u64>,
    pub workdir: Option<PathBuf>,
    pub renew_days_before: Option<u64>,
}

/// Fully resolved run settings.
#[derive(Clone)]
pub struct Settings {
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub api_token: String,
    pub zone_id: Option<String>,
    pub staging: bool,
    pub propagation: Duration,
    pub workdir: PathBuf,
    pub renew_before: Duration,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("domains", &self.domains)
            .field("email", &self.email)
            .field("api_token", &"<redacted>")
            .field("zone_id", &self.zone_id)
            .field("staging", &self.staging)
            .field("propagation", &self.propagation)
            .field("workdir", &self.workdir)
            .field("renew_before", &self.renew_before)
            .finish()
    }
}

/// Layered lookup: command line, then env file, then process environment.
struct Sources<'a, F> {
    env_file: &'a BTreeMap<String, String>,
    process_env: F,
}

impl<F: Fn(&str) -> Option<String>> Sources<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        self.env_file
            .get(key)
            .cloned()
            .filter(|v| !v.is_empty())
            .or_else(|| (self.process_env)(key).filter(|v| !v.is_empty()))
    }

    fn get_u64(&self, key: &'static str) -> Result<Option<u64>, SettingsError> {
        self.get(key)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| SettingsError::InvalidNumber { key, value })
            })
            .transpose()
    }
}

impl Settings {
    /// Resolve settings for issuing a certificate. Domain, email and API
    /// token are all required and checked in that order.
    pub fn resolve(
        args: &SettingsArgs,
        env_file: &BTreeMap<String, String>,
        process_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        let sources = Sources {
            env_file,
            process_env,
        };
        let domains = resolve_domains(args, &sources)?;
        if domains.is_empty() {
            return Err(SettingsError::MissingDomain);
        }
        let email = resolve_email(args, &sources)?.ok_or(SettingsError::MissingEmail)?;
        Self::resolve_rest(args, &sources, domains, Some(email))
    }

    /// Resolve settings for renewing existing lineages. Domains and email
    /// are optional here since they are taken from the stored certificates
    /// and account.
    pub fn resolve_for_renew(
        args: &SettingsArgs,
        env_file: &BTreeMap<String, String>,
        process_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        let sources = Sources {
            env_file,
            process_env,
        };
        let domains = resolve_domains(args, &sources)?;
        let email = resolve_email(args, &sources)?;
        Self::resolve_rest(args, &sources, domains, email)
    }

    fn resolve_rest<F: Fn(&str) -> Option<String>>(
        args: &SettingsArgs,
        sources: &Sources<'_, F>,
        domains: Vec<String>,
        email: Option<String>,
    ) -> Result<Self, SettingsError> {
        let api_token = validate_credentials(sources.get("CLOUDFLARE_API_TOKEN").as_deref())?
            .to_string();
        let zone_id = args
            .zone_id
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| sources.get("CLOUDFLARE_ZONE_ID"));
        let Location { workdir, staging } = Location::from_sources(args, sources);
        let propagation_seconds = match args.propagation_seconds {
            Some(secs) => secs,
            None => sources
                .get_u64("PROPAGATION_SECONDS")?
                .unwrap_or(DEFAULT_PROPAGATION_SECONDS),
        };
        let renew_days_before = match args.renew_days_before {
            Some(days) => days,
            None => sources
                .get_u64("RENEW_DAYS_BEFORE")?
                .unwrap_or(DEFAULT_RENEW_DAYS_BEFORE),
        };
        let renew_before = renew_days_before
            .checked_mul(24 * 60 * 60)
            .ok_or_else(|| SettingsError::InvalidNumber {
                key: "RENEW_DAYS_BEFORE",
                value: renew_days_before.to_string(),
            })?;
        Ok(Self {
            domains,
            email,
            api_token,
            zone_id,
            staging,
            propagation: Duration::from_secs(propagation_seconds),
            workdir,
            renew_before: Duration::from_secs(renew_before),
        })
    }

    pub fn acme_url(&self) -> &'static str {
        acme_url(self.staging)
    }
}

/// Where certificates live and which ACME environment they belong to.
///
/// This is the part of the settings that needs no credentials, used to
/// inspect stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub workdir: PathBuf,
    pub staging: bool,
}

impl Location {
    pub fn resolve(
        args: &SettingsArgs,
        env_file: &BTreeMap<String, String>,
        process_env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let sources = Sources {
            env_file,
            process_env,
        };
        Self::from_sources(args, &sources)
    }

    fn from_sources<F: Fn(&str) -> Option<String>>(
        args: &SettingsArgs,
        sources: &Sources<'_, F>,
    ) -> Self {
        let workdir = args
            .workdir
            .clone()
            .or_else(|| sources.get("CERT_WORKDIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
        let staging = args.staging || sources.get("STAGING").as_deref() == Some("1");
        Self { workdir, staging }
    }

    pub fn acme_url(&self) -> &'static str {
        acme_url(self.staging)
    }
}

/// The Let's Encrypt directory for the selected environment.
pub fn acme_url(staging: bool) -> &'static str {
    if staging {
        instant_acme::LetsEncrypt::Staging.url()
    } else {
        instant_acme::LetsEncrypt::Production.url()
    }
}

/// Check that an API token is present and non-empty.
pub fn validate_credentials(api_token: Option<&str>) -> Result<&str, SettingsError> {
    match api_token {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(SettingsError::MissingApiToken),
    }
}

fn resolve_domains<F: Fn(&str) -> Option<String>>(
    args: &SettingsArgs,
    sources: &Sources<'_, F>,
) -> Result<Vec<String>, SettingsError> {
    let raw = if args.domains.iter().any(|d| !d.trim().is_empty()) {
        args.domains.clone()
    } else {
        sources.get("DOMAIN").into_iter().collect()
    };
    let mut domains: Vec<String> = Vec::new();
    for name in raw.iter().flat_map(|d| d.split(',')) {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let name = normalize_domain(name)?;
        if !domains.contains(&name) {
            domains.push(name);
        }
    }
    Ok(domains)
}

fn resolve_email<F: Fn(&str) -> Option<String>>(
    args: &SettingsArgs,
    sources: &Sources<'_, F>,
) -> Result<Option<String>, SettingsError> {
    let email = args
        .email
        .clone()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .or_else(|| sources.get("EMAIL").map(|e| e.trim().to_string()));
    match email {
        Some(email) if !is_plausible_email(&email) => Err(SettingsError::InvalidEmail(email)),
        email => Ok(email),
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, host)) => {
            !local.is_empty() && !host.is_empty() && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Lower-case a domain name, drop a trailing dot and reject obviously
/// malformed names.
pub fn normalize_domain(name: &str) -> Result<String, SettingsError> {
    let normalized = name.trim().trim_end_matches('.').to_ascii_lowercase();
    let base = normalized.strip_prefix("*.").unwrap_or(&normalized);
    let valid = base.contains('.')
        && base.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if !valid {
        return Err(SettingsError::InvalidDomain(name.to_string()));
    }
    Ok(normalized)
}

/// Commented `.env` template written by `cfcert env-template`.
#[derive(Debug, DocumentedFields)]
pub struct EnvTemplate {
    /// Cloudflare API token with Zone:Read and DNS:Edit permissions
    cloudflare_api_token: String,
    /// Cloudflare zone ID. Leave empty to look the zone up by domain name
    cloudflare_zone_id: String,
    /// Domain(s) to request the certificate for, comma separated
    domain: String,
    /// Contact email registered with the ACME account
    email: String,
    /// Set to 1 to use the Let's Encrypt staging server
    staging: String,
    /// Seconds to wait for DNS propagation before validating
    propagation_seconds: u64,
    /// Directory holding accounts, archived and live certificates
    cert_workdir: String,
    /// Renew certificates that expire within this many days
    renew_days_before: u64,
}

impl Default for EnvTemplate {
    fn default() -> Self {
        Self {
            cloudflare_api_token: "".into(),
            cloudflare_zone_id: "".into(),
            domain: "example.com".into(),
            email: "admin@example.com".into(),
            staging: "1".into(),
            propagation_seconds: DEFAULT_PROPAGATION_SECONDS,
            cert_workdir: DEFAULT_WORKDIR.into(),
            renew_days_before: DEFAULT_RENEW_DAYS_BEFORE,
        }
    }
}

impl EnvTemplate {
    fn entries(&self) -> [(&'static str, String); 8] {
        [
            ("CLOUDFLARE_API_TOKEN", self.cloudflare_api_token.clone()),
            ("CLOUDFLARE_ZONE_ID", self.cloudflare_zone_id.clone()),
            ("DOMAIN", self.domain.clone()),
            ("EMAIL", self.email.clone()),
            ("STAGING", self.staging.clone()),
            ("PROPAGATION_SECONDS", self.propagation_seconds.to_string()),
            ("CERT_WORKDIR", self.cert_workdir.clone()),
            ("RENEW_DAYS_BEFORE", self.renew_days_before.to_string()),
        ]
    }

    pub fn to_commented_env(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.entries().into_iter().enumerate() {
            let docstring = Self::FIELD_DOCS[i];
            for line in docstring.lines() {
                if line.is_empty() {
                    out.push_str("#\n");
                } else {
                    out.push_str(&format!("# {line}\n"));
                }
            }
            out.push_str(&format!("{key}={value}\n\n"));
        }
        out
    }
}
