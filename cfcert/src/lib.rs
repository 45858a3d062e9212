//! Let's Encrypt certificates through Cloudflare DNS-01 challenges.
//!
//! This library requests and renews TLS certificates using the ACME protocol,
//! proving domain control by publishing `_acme-challenge` TXT records through
//! the Cloudflare API.
//!
//! # Features
//!
//! - Certificate issuance and renewal with a configurable renewal window
//! - Cloudflare zone lookup from the domain name
//! - certbot style `archive/` and `live/` layout on disk
//! - `.env` file based configuration
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cfcert::{CertBotConfig, Outcome};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CertBotConfig::builder()
//!         .acme_url(cfcert::acme_url(true))
//!         .contact_email("admin@example.com".to_string())
//!         .cf_api_token("your_cloudflare_api_token")
//!         .workdir("/etc/letsencrypt")
//!         .domains(vec!["example.com".to_string()])
//!         .propagation_delay(Duration::from_secs(10))
//!         .renew_expires_in(Duration::from_secs(30 * 24 * 3600))
//!         .build();
//!
//!     let bot = config.build_bot().await?;
//!     if let Outcome::Issued { cert_dir } = bot.request().await? {
//!         println!("new certificate in {}", cert_dir.display());
//!     }
//!     Ok(())
//! }
//! ```
pub use acme_client::{cert_not_after, extract_subject_alt_names, need_renew, AcmeClient};
pub use bot::{list_lineages, CertBot, CertBotConfig, LineageInfo, Outcome};
pub use dns01_client::{CloudflareClient, Dns01Client};
pub use env_file::load_env_file;
pub use settings::{
    acme_url, validate_credentials, EnvTemplate, Location, Settings, SettingsArgs,
    SettingsError, DEFAULT_WORKDIR,
};
pub use workdir::{lineage_name, WorkDir};

mod acme_client;
mod bot;
mod dns01_client;
mod env_file;
mod settings;
mod workdir;
