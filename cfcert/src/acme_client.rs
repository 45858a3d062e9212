use anyhow::{bail, Context, Result};
use hickory_resolver::error::ResolveErrorKind;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, future::Future, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};
use x509_parser::prelude::{GeneralName, Pem};

use super::dns01_client::{Dns01Api, Dns01Client};

const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(600);

/// An ACME account bound to a DNS-01 provider.
pub struct AcmeClient {
    account: Account,
    credentials: Credentials,
    dns01_client: Dns01Client,
    propagation_delay: Duration,
    order_timeout: Duration,
}

#[derive(Debug, Clone)]
struct Challenge {
    id: String,
    acme_domain: String,
    url: String,
    dns_value: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct Credentials {
    pub(crate) account_id: String,
    credentials: AccountCredentials,
}

impl AcmeClient {
    pub async fn load(dns01_client: Dns01Client, encoded_credentials: &str) -> Result<Self> {
        let credentials: Credentials = serde_json::from_str(encoded_credentials)
            .context("failed to parse account credentials")?;
        let account = Account::from_credentials(credentials.credentials)
            .await
            .context("failed to load account")?;
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        Ok(Self {
            account,
            dns01_client,
            credentials,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            order_timeout: DEFAULT_ORDER_TIMEOUT,
        })
    }

    /// Create a new account.
    ///
    /// The contact email, if any, is registered as a `mailto:` URI.
    pub async fn new_account(
        acme_url: &str,
        contact_email: Option<&str>,
        dns01_client: Dns01Client,
    ) -> Result<Self> {
        let contact = contact_email.map(|email| format!("mailto:{email}"));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            acme_url,
            None,
        )
        .await
        .context("failed to create new account")?;
        let credentials = Credentials {
            account_id: account.id().to_string(),
            credentials,
        };
        Ok(Self {
            account,
            dns01_client,
            credentials,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            order_timeout: DEFAULT_ORDER_TIMEOUT,
        })
    }

    /// Time to wait after publishing challenge records before checking them.
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Give up on an order after this long. Challenge records are still
    /// removed when the limit is hit.
    pub fn with_order_timeout(mut self, limit: Duration) -> Self {
        self.order_timeout = limit;
        self
    }

    /// Dump the account credentials to a JSON string.
    pub fn dump_credentials(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.credentials)?)
    }

    /// Read the account ID from the encoded credentials.
    pub fn account_id(&self) -> &str {
        &self.credentials.account_id
    }

    /// Request new certificates for the given domains.
    ///
    /// Returns the new certificates encoded in PEM format.
    pub async fn request_new_certificate(&self, key: &str, domains: &[String]) -> Result<String> {
        info!("requesting new certificates for {}", domains.join(", "));
        let mut challenges = Vec::new();
        let result = within(
            self.order_timeout,
            self.request_new_certificate_inner(key, domains, &mut challenges),
        )
        .await;
        for challenge in &challenges {
            debug!("removing dns record {}", challenge.id);
            if let Err(err) = self.dns01_client.remove_record(&challenge.id).await {
                error!("failed to remove dns record {}: {err:?}", challenge.id);
            }
        }
        result
    }
}

impl AcmeClient {
    async fn authorize(&self, order: &mut Order, challenges: &mut Vec<Challenge>) -> Result<()> {
        let authorizations = order
            .authorizations()
            .await
            .context("failed to get authorizations")?;
        // example.com and *.example.com share a challenge name, clean it once
        let mut cleaned = BTreeSet::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                _ => bail!("unsupported authorization status: {:?}", authz.status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .context("no dns01 challenge found")?;

            let Identifier::Dns(identifier) = &authz.identifier;

            let dns_value = order.key_authorization(challenge).dns_value();
            debug!("creating dns record for {}", identifier);
            let acme_domain = format!("_acme-challenge.{identifier}");
            if cleaned.insert(acme_domain.clone()) {
                self.dns01_client
                    .remove_txt_records(&acme_domain)
                    .await
                    .context("failed to remove existing dns record")?;
            }
            let id = self
                .dns01_client
                .add_txt_record(&acme_domain, &dns_value)
                .await
                .context("failed to create dns record")?;
            challenges.push(Challenge {
                id,
                acme_domain,
                url: challenge.url.clone(),
                dns_value,
            });
        }
        Ok(())
    }

    /// Self check the TXT records for the given challenges.
    async fn check_dns(&self, challenges: &[Challenge]) -> Result<()> {
        let mut delay = Duration::from_millis(250);
        let mut tries = 1u8;

        let mut unsettled_challenges = challenges.to_vec();

        'outer: loop {
            use hickory_resolver::AsyncResolver;

            sleep(delay).await;

            let dns_resolver =
                AsyncResolver::tokio_from_system_conf().context("failed to create dns resolver")?;

            while let Some(challenge) = unsettled_challenges.pop() {
                let settled = match dns_resolver.txt_lookup(&challenge.acme_domain).await {
                    Ok(record) => record
                        .iter()
                        .any(|txt| txt.to_string() == challenge.dns_value),
                    Err(err) => {
                        let ResolveErrorKind::NoRecordsFound { .. } = err.kind() else {
                            bail!(
                                "failed to lookup dns record {}: {err}",
                                challenge.acme_domain
                            );
                        };
                        false
                    }
                };
                if !settled {
                    delay *= 2;
                    tries += 1;
                    if tries < 10 {
                        debug!(
                            tries,
                            domain = &challenge.acme_domain,
                            "challenge not found, waiting {delay:?}"
                        );
                    } else {
                        bail!("dns record {} not found", challenge.acme_domain);
                    }
                    unsettled_challenges.push(challenge);
                    continue 'outer;
                }
            }
            break;
        }
        Ok(())
    }

    async fn request_new_certificate_inner(
        &self,
        key: &str,
        domains: &[String],
        challenges: &mut Vec<Challenge>,
    ) -> Result<String> {
        debug!("creating new order");
        let identifiers = domains
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;
        let mut challenges_ready = false;
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                // Need to accept the challenge
                OrderStatus::Pending => {
                    if challenges_ready {
                        debug!("challenges are ready, waiting for order to be ready");
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    debug!("order is pending, waiting for authorization");
                    self.authorize(&mut order, challenges)
                        .await
                        .context("failed to authorize")?;
                    if challenges.is_empty() {
                        bail!("no challenges found");
                    }
                    info!(
                        "waiting {}s for dns propagation",
                        self.propagation_delay.as_secs()
                    );
                    sleep(self.propagation_delay).await;
                    self.check_dns(challenges)
                        .await
                        .context("failed to check dns")?;
                    for challenge in &*challenges {
                        debug!("setting challenge ready for {}", challenge.url);
                        order
                            .set_challenge_ready(&challenge.url)
                            .await
                            .context("failed to set challenge ready")?;
                    }
                    challenges_ready = true;
                    continue;
                }
                // To upload CSR
                OrderStatus::Ready => {
                    debug!("order is ready, uploading CSR");
                    let csr = make_csr(key, domains)?;
                    order
                        .finalize(csr.as_ref())
                        .await
                        .context("failed to finalize order")?;
                    continue;
                }
                // Need to wait for the challenge to be accepted
                OrderStatus::Processing => {
                    debug!("order is processing, waiting for the CSR to be accepted");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                // Certificate is ready
                OrderStatus::Valid => {
                    debug!("order is valid, getting certificate");
                    return extract_certificate(order).await;
                }
                // Something went wrong
                OrderStatus::Invalid => bail!("order is invalid"),
            }
        }
    }
}

fn make_csr(key: &str, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key = KeyPair::from_pem(key).context("failed to parse private key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}

async fn extract_certificate(mut order: Order) -> Result<String> {
    let mut tries = 0;
    let cert_chain_pem = loop {
        tries += 1;
        if tries > 5 {
            bail!("failed to get certificate");
        }
        match order
            .certificate()
            .await
            .context("failed to get certificate")?
        {
            Some(cert_chain_pem) => break cert_chain_pem,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    Ok(cert_chain_pem)
}

/// Run `fut` to completion or fail once `limit` has elapsed.
///
/// Whatever `fut` wrote through its borrows before being cut off stays
/// visible to the caller.
async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, fut)
        .await
        .with_context(|| format!("requesting cert timed out after {}s", limit.as_secs()))?
}

/// Whether the leaf certificate expires within `expires_in`.
///
/// A window reaching past the representable date range always needs renewal.
pub fn need_renew(cert_pem: &str, expires_in: Duration) -> Result<bool> {
    let not_after = cert_not_after(cert_pem)?;
    let now = time::OffsetDateTime::now_utc();
    debug!("will expire in {:?}", not_after - now);

    let deadline = time::Duration::try_from(expires_in)
        .ok()
        .and_then(|window| now.checked_add(window));
    Ok(match deadline {
        Some(deadline) => not_after < deadline,
        None => true,
    })
}

/// Expiry time of the leaf certificate.
pub fn cert_not_after(cert_pem: &str) -> Result<time::OffsetDateTime> {
    let pem = read_pem(cert_pem)?;
    let cert = pem.parse_x509().context("Invalid x509 certificate")?;
    Ok(cert.validity().not_after.to_datetime())
}

pub(crate) fn read_pem(cert_pem: &str) -> Result<Pem> {
    Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("Invalid pem")?
        .context("no certificate in pem")
}

/// DNS names listed in the leaf certificate's subject alternative names.
pub fn extract_subject_alt_names(cert_pem: &str) -> Result<Vec<String>> {
    let pem = read_pem(cert_pem)?;
    let cert = pem.parse_x509().context("Invalid x509 certificate")?;
    let subject_alt_names = cert
        .tbs_certificate
        .subject_alternative_name()
        .context("failed to parse subject alternative name")?
        .context("no subject alternative name found")?;
    let mut domains = Vec::new();
    for name in &subject_alt_names.value.general_names {
        if let GeneralName::DNSName(dns) = name {
            domains.push(dns.to_string());
        } else {
            bail!("unsupported general name: {:?}", name);
        }
    }
    Ok(domains)
}

#[cfg(test)]
mod tests;
