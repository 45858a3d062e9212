use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use cfcert::{
    list_lineages, load_env_file, CertBot, CertBotConfig, EnvTemplate, Location, Outcome,
    Settings, SettingsArgs, WorkDir,
};
use clap::{Args as ClapArgs, Parser};
use fs_err as fs;
use tracing::info;

#[derive(ClapArgs)]
struct CommonArgs {
    /// Path to the .env file
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
    /// Directory holding accounts and certificates (default: /etc/letsencrypt, env: CERT_WORKDIR)
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Use Let's Encrypt staging server (env: STAGING=1)
    #[arg(long)]
    staging: bool,
    /// Cloudflare zone ID, looked up from the domain when omitted (env: CLOUDFLARE_ZONE_ID)
    #[arg(long)]
    zone_id: Option<String>,
    /// DNS propagation wait time in seconds (default: 10, env: PROPAGATION_SECONDS)
    #[arg(long)]
    propagation_seconds: Option<u64>,
    /// Renew certificates expiring within this many days (default: 30, env: RENEW_DAYS_BEFORE)
    #[arg(long)]
    renew_days_before: Option<u64>,
    /// Renew even if the certificate is not due
    #[arg(long)]
    force_renewal: bool,
    /// Give up on a certificate after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

#[derive(Parser)]
enum Command {
    /// Request a certificate, or renew it if it is close to expiration
    Request {
        /// Domain name to request certificate for, repeat or comma separate for more names (env: DOMAIN)
        #[arg(short, long = "domain")]
        domains: Vec<String>,
        /// Email address for certificate notifications (env: EMAIL)
        #[arg(short, long)]
        email: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Renew all stored certificates that are close to expiration
    Renew {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List stored certificates
    List {
        /// Path to the .env file
        #[arg(long, default_value = ".env")]
        env_file: PathBuf,
        /// Directory holding accounts and certificates
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Show the staging account
        #[arg(long)]
        staging: bool,
    },
    /// Generate a .env template
    EnvTemplate {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
#[command(author, version, about = "Request TLS certificates from Let's Encrypt using Cloudflare DNS")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

impl CommonArgs {
    fn settings_args(&self, domains: Vec<String>, email: Option<String>) -> SettingsArgs {
        SettingsArgs {
            domains,
            email,
            zone_id: self.zone_id.clone(),
            staging: self.staging,
            propagation_seconds: self.propagation_seconds,
            workdir: self.workdir.clone(),
            renew_days_before: self.renew_days_before,
        }
    }

    fn bot_config(&self, settings: Settings) -> CertBotConfig {
        CertBotConfig::builder()
            .acme_url(settings.acme_url())
            .maybe_contact_email(settings.email)
            .cf_api_token(settings.api_token)
            .maybe_cf_zone_id(settings.zone_id)
            .workdir(settings.workdir)
            .domains(settings.domains)
            .propagation_delay(settings.propagation)
            .renew_expires_in(settings.renew_before)
            .force(self.force_renewal)
            .timeout(Duration::from_secs(self.timeout))
            .build()
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

async fn request(domains: Vec<String>, email: Option<String>, common: CommonArgs) -> Result<()> {
    let env_vars = load_env_file(&common.env_file)?;
    let settings = Settings::resolve(
        &common.settings_args(domains, email),
        &env_vars,
        process_env,
    )?;
    let domain_list = settings.domains.join(", ");
    println!("Requesting certificate for {domain_list}...");
    println!(
        "Using Cloudflare API (propagation wait: {}s)",
        settings.propagation.as_secs()
    );
    if settings.staging {
        println!("Warning: using STAGING environment (test certificates)");
    }

    let bot = common
        .bot_config(settings)
        .build_bot()
        .await
        .context("Failed to build bot")?;
    let outcome = bot
        .request()
        .await
        .context("Failed to obtain certificate")?;
    match outcome {
        Outcome::Issued { .. } | Outcome::Renewed { .. } => {
            println!("Certificate successfully obtained for {domain_list}");
            println!("Certificate location: {}/", bot.live_dir().display());
        }
        Outcome::NotDue { not_after } => {
            println!("Certificate not yet due for renewal (expires {not_after}); no action taken");
            println!("Certificate location: {}/", bot.live_dir().display());
        }
    }
    Ok(())
}

async fn renew(common: CommonArgs) -> Result<()> {
    let env_vars = load_env_file(&common.env_file)?;
    let settings = Settings::resolve_for_renew(
        &common.settings_args(vec![], None),
        &env_vars,
        process_env,
    )?;
    let config = common.bot_config(settings);
    let results = CertBot::renew_all(&config).await?;
    if results.is_empty() {
        println!("No certificates found in {}", config.workdir().workdir().display());
        return Ok(());
    }
    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(Outcome::Issued { .. } | Outcome::Renewed { .. }) => println!("{name}: renewed"),
            Ok(Outcome::NotDue { not_after }) => println!("{name}: not due (expires {not_after})"),
            Err(err) => {
                failed += 1;
                println!("{name}: failed: {err:#}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} certificates failed to renew", results.len());
    }
    Ok(())
}

fn list(env_file: PathBuf, workdir: Option<PathBuf>, staging: bool) -> Result<()> {
    let env_vars = load_env_file(&env_file)?;
    let args = SettingsArgs {
        workdir,
        staging,
        ..Default::default()
    };
    let location = Location::resolve(&args, &env_vars, process_env);
    let workdir = WorkDir::new(&location.workdir);
    match workdir.acme_account_uri(location.acme_url()) {
        Ok(Some(account)) => println!("Account: {account}"),
        Ok(None) => println!("Account: none for {}", location.acme_url()),
        Err(err) => println!("Account: unreadable: {err:#}"),
    }
    let lineages = list_lineages(&workdir)?;
    if lineages.is_empty() {
        println!("No certificates found in {}", location.workdir.display());
    }
    for lineage in lineages {
        println!("{}", lineage.name);
        println!("  Domains: {}", lineage.domains.join(" "));
        println!("  Expiry: {}", lineage.not_after);
        println!("  Certificate: {}", lineage.cert_path.display());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let args = Args::parse();
    match args.command {
        Command::Request {
            domains,
            email,
            common,
        } => {
            request(domains, email, common).await?;
        }
        Command::Renew { common } => {
            renew(common).await?;
        }
        Command::List {
            env_file,
            workdir,
            staging,
        } => {
            list(env_file, workdir, staging)?;
        }
        Command::EnvTemplate { write_to } => {
            let template = EnvTemplate::default().to_commented_env();
            match write_to {
                Some(path) => {
                    fs::write(&path, template)?;
                    info!("wrote template to {}", path.display());
                }
                None => print!("{template}"),
            }
        }
    }
    Ok(())
}
