use std::{
    collections::BTreeSet,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use fs_err as fs;
use rcgen::KeyPair;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::{
    acme_client::{cert_not_after, extract_subject_alt_names, need_renew},
    dns01_client::{zone_covers, CloudflareClient},
    workdir::{lineage_name, write_private, WorkDir},
};

use super::{AcmeClient, Dns01Client};

#[allow(clippy::duplicated_attributes)]
#[derive(Clone, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct CertBotConfig {
    acme_url: String,
    contact_email: Option<String>,
    cf_api_token: String,
    cf_zone_id: Option<String>,
    workdir: PathBuf,
    #[builder(default)]
    domains: Vec<String>,
    propagation_delay: Duration,
    renew_expires_in: Duration,
    #[builder(default)]
    force: bool,
    #[builder(default = Duration::from_secs(600))]
    timeout: Duration,
    #[builder(default = true)]
    auto_create_account: bool,
}

impl fmt::Debug for CertBotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBotConfig")
            .field("acme_url", &self.acme_url)
            .field("contact_email", &self.contact_email)
            .field("cf_zone_id", &self.cf_zone_id)
            .field("workdir", &self.workdir)
            .field("domains", &self.domains)
            .field("propagation_delay", &self.propagation_delay)
            .field("renew_expires_in", &self.renew_expires_in)
            .field("force", &self.force)
            .field("timeout", &self.timeout)
            .field("auto_create_account", &self.auto_create_account)
            .finish_non_exhaustive()
    }
}

impl CertBotConfig {
    pub async fn build_bot(&self) -> Result<CertBot> {
        CertBot::build(self.clone()).await
    }

    pub fn workdir(&self) -> WorkDir {
        WorkDir::new(&self.workdir)
    }
}

/// Result of a single issuance pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new certificate was issued for a new or changed set of domains.
    Issued { cert_dir: PathBuf },
    /// An existing certificate was replaced.
    Renewed { cert_dir: PathBuf },
    /// The live certificate is still valid for longer than the renewal window.
    NotDue { not_after: OffsetDateTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Issue,
    Renew,
    Skip(OffsetDateTime),
}

/// Decide what to do with the live certificate of a lineage.
fn plan(
    live_cert: Option<&str>,
    domains: &[String],
    renew_expires_in: Duration,
    force: bool,
) -> Result<Action> {
    let Some(cert_pem) = live_cert else {
        return Ok(Action::Issue);
    };
    let current = extract_subject_alt_names(cert_pem).context("failed to read live cert")?;
    let current = current.iter().collect::<BTreeSet<_>>();
    let wanted = domains.iter().collect::<BTreeSet<_>>();
    if current != wanted {
        info!("domain set changed, requesting a new certificate");
        return Ok(Action::Issue);
    }
    if force {
        return Ok(Action::Renew);
    }
    if need_renew(cert_pem, renew_expires_in)? {
        return Ok(Action::Renew);
    }
    Ok(Action::Skip(cert_not_after(cert_pem)?))
}

pub struct CertBot {
    acme_client: AcmeClient,
    workdir: WorkDir,
    config: CertBotConfig,
}

impl CertBot {
    /// Build a new `CertBot` from a `CertBotConfig`.
    pub async fn build(config: CertBotConfig) -> Result<Self> {
        let Some(first_domain) = config.domains.first() else {
            bail!("no domain configured");
        };
        let workdir = config.workdir();
        workdir.prepare()?;
        let dns01_client = Dns01Client::cloudflare_for_domain(
            config.cf_zone_id.clone(),
            config.cf_api_token.clone(),
            first_domain,
        )
        .await
        .context("failed to set up cloudflare client")?;
        let credentials_file = workdir.account_credentials_path(&config.acme_url);
        let acme_client = match fs::read_to_string(&credentials_file) {
            Ok(credentials) => AcmeClient::load(dns01_client, &credentials).await?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !config.auto_create_account {
                    return Err(e).context("credentials file not found");
                }
                info!("creating new ACME account");
                let client = AcmeClient::new_account(
                    &config.acme_url,
                    config.contact_email.as_deref(),
                    dns01_client,
                )
                .await
                .context("failed to create new account")?;
                let credentials = client
                    .dump_credentials()
                    .context("failed to dump credentials")?;
                if let Some(credential_dir) = credentials_file.parent() {
                    fs::create_dir_all(credential_dir)
                        .context("failed to create credential directory")?;
                }
                write_private(&credentials_file, &credentials)
                    .context("failed to write credentials")?;
                info!("created new ACME account: {}", client.account_id());
                client
            }
            Err(e) => {
                return Err(e).context("failed to read credentials file");
            }
        };
        let acme_client = acme_client
            .with_propagation_delay(config.propagation_delay)
            .with_order_timeout(config.timeout);
        Ok(Self {
            acme_client,
            workdir,
            config,
        })
    }

    /// Get the ACME account ID.
    pub fn account_id(&self) -> &str {
        self.acme_client.account_id()
    }

    /// Lineage directory name of the configured domains.
    pub fn lineage_name(&self) -> String {
        self.config
            .domains
            .first()
            .map(|d| lineage_name(d))
            .unwrap_or_default()
    }

    /// Directory holding the live links of the configured lineage.
    pub fn live_dir(&self) -> PathBuf {
        self.workdir.live_dir(&self.lineage_name())
    }

    /// Issue or renew the certificate for the configured domains.
    ///
    /// The ACME order is bounded by the configured timeout.
    pub async fn request(&self) -> Result<Outcome> {
        let name = self.lineage_name();
        let cert_path = self.workdir.cert_path(&name);
        let key_path = self.workdir.key_path(&name);
        let live_cert = read_optional(&cert_path)?;
        let live_key = read_optional(&key_path)?;

        let action = plan(
            live_cert.as_deref(),
            &self.config.domains,
            self.config.renew_expires_in,
            self.config.force,
        )?;
        if let Action::Skip(not_after) = action {
            info!("certificate {} is up to date", cert_path.display());
            return Ok(Outcome::NotDue { not_after });
        }

        let key_pem = match live_key {
            Some(key_pem) => {
                debug!("using existing cert key pair");
                key_pem
            }
            None => {
                debug!("generating new cert key pair");
                let key = KeyPair::generate().context("failed to generate key")?;
                key.serialize_pem()
            }
        };
        let cert_pem = self
            .acme_client
            .request_new_certificate(&key_pem, &self.config.domains)
            .await?;
        let cert_dir = self
            .workdir
            .store_cert(&name, &cert_pem, &key_pem)
            .context("failed to store certificate")?;
        info!("stored certificate for {} in {}", name, cert_dir.display());
        Ok(match action {
            Action::Renew => Outcome::Renewed { cert_dir },
            _ => Outcome::Issued { cert_dir },
        })
    }

    /// Renew every lineage under the workdir that is due.
    ///
    /// Each lineage is renewed for the names in its current certificate.
    /// A failure is reported for that lineage and does not stop the rest.
    pub async fn renew_all(config: &CertBotConfig) -> Result<Vec<(String, Result<Outcome>)>> {
        let workdir = config.workdir();
        let mut results = vec![];
        let mut zone_name = None;
        for name in workdir.list_lineages()? {
            let result = Self::renew_lineage(config, &workdir, &name, &mut zone_name).await;
            if let Err(err) = &result {
                error!("failed to renew {name}: {err:?}");
            }
            results.push((name, result));
        }
        Ok(results)
    }

    async fn renew_lineage(
        config: &CertBotConfig,
        workdir: &WorkDir,
        name: &str,
        zone_name: &mut Option<String>,
    ) -> Result<Outcome> {
        let cert_pem = fs::read_to_string(workdir.cert_path(name))?;
        if !config.force && !need_renew(&cert_pem, config.renew_expires_in)? {
            info!("certificate {name} is up to date");
            return Ok(Outcome::NotDue {
                not_after: cert_not_after(&cert_pem)?,
            });
        }
        let domains = lineage_domains(name, &cert_pem)?;
        let mut config = config.clone();
        if let Some(zone_id) = &config.cf_zone_id {
            let zone = match zone_name.clone() {
                Some(zone) => zone,
                None => {
                    let client =
                        CloudflareClient::new(zone_id.clone(), config.cf_api_token.clone());
                    let zone = client
                        .zone_name()
                        .await
                        .context("failed to look up the configured zone")?;
                    *zone_name = Some(zone.clone());
                    zone
                }
            };
            if !zone_covers(&zone, &domains[0]) {
                info!("{name} is outside zone {zone}, looking up its zone");
                config.cf_zone_id = None;
            }
        }
        config.domains = domains;
        config.build_bot().await?.request().await
    }
}

/// Names of a lineage's certificate, ordered so that the one the lineage is
/// named after comes first.
fn lineage_domains(name: &str, cert_pem: &str) -> Result<Vec<String>> {
    let mut domains = extract_subject_alt_names(cert_pem)?;
    let Some(pos) = domains.iter().position(|d| lineage_name(d) == name) else {
        bail!("certificate of lineage {name} does not cover {name}");
    };
    let primary = domains.remove(pos);
    domains.insert(0, primary);
    Ok(domains)
}

/// Summary of a lineage for display.
#[derive(Debug, Clone)]
pub struct LineageInfo {
    pub name: String,
    pub domains: Vec<String>,
    pub not_after: OffsetDateTime,
    pub cert_path: PathBuf,
}

/// Describe every lineage under `workdir`.
pub fn list_lineages(workdir: &WorkDir) -> Result<Vec<LineageInfo>> {
    workdir
        .list_lineages()?
        .into_iter()
        .map(|name| -> Result<LineageInfo> {
            let cert_path = workdir.cert_path(&name);
            let cert_pem = fs::read_to_string(&cert_path).context("failed to read cert")?;
            Ok(LineageInfo {
                domains: extract_subject_alt_names(&cert_pem).context("failed to parse cert")?,
                not_after: cert_not_after(&cert_pem)?,
                name,
                cert_path,
            })
        })
        .collect()
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests;
