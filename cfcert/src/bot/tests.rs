use super::*;

fn self_signed(names: &[&str], valid_for: time::Duration) -> String {
    let key = KeyPair::generate().unwrap();
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let mut params = rcgen::CertificateParams::new(names).unwrap();
    params.not_after = OffsetDateTime::now_utc() + valid_for;
    params.self_signed(&key).unwrap().pem()
}

fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 3600);

#[test]
fn plan_issues_without_live_cert() {
    let action = plan(None, &domains(&["example.com"]), THIRTY_DAYS, false).unwrap();
    assert_eq!(action, Action::Issue);
}

#[test]
fn plan_skips_fresh_cert() {
    let cert = self_signed(&["example.com"], time::Duration::days(80));
    let action = plan(Some(&cert), &domains(&["example.com"]), THIRTY_DAYS, false).unwrap();
    assert!(matches!(action, Action::Skip(_)));
}

#[test]
fn plan_renews_expiring_or_forced() {
    let expiring = self_signed(&["example.com"], time::Duration::days(3));
    let action = plan(Some(&expiring), &domains(&["example.com"]), THIRTY_DAYS, false).unwrap();
    assert_eq!(action, Action::Renew);

    let fresh = self_signed(&["example.com"], time::Duration::days(80));
    let action = plan(Some(&fresh), &domains(&["example.com"]), THIRTY_DAYS, true).unwrap();
    assert_eq!(action, Action::Renew);
}

#[test]
fn plan_reissues_when_domains_change() {
    let cert = self_signed(&["example.com"], time::Duration::days(80));
    let wanted = domains(&["example.com", "*.example.com"]);
    let action = plan(Some(&cert), &wanted, THIRTY_DAYS, false).unwrap();
    assert_eq!(action, Action::Issue);

    // order does not matter
    let cert = self_signed(&["*.example.com", "example.com"], time::Duration::days(80));
    let action = plan(Some(&cert), &wanted, THIRTY_DAYS, false).unwrap();
    assert!(matches!(action, Action::Skip(_)));
}

#[test]
fn lineage_domains_put_primary_first() {
    let cert = self_signed(&["www.example.com", "*.example.com"], time::Duration::days(1));
    assert_eq!(
        lineage_domains("_wildcard.example.com", &cert).unwrap(),
        vec!["*.example.com", "www.example.com"]
    );
    assert!(lineage_domains("other.example.com", &cert).is_err());
}

#[test]
fn lists_stored_lineages() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(dir.path());
    workdir.prepare().unwrap();
    let cert = self_signed(&["example.com", "www.example.com"], time::Duration::days(42));
    workdir.store_cert("example.com", &cert, "KEY").unwrap();

    let lineages = list_lineages(&workdir).unwrap();
    assert_eq!(lineages.len(), 1);
    assert_eq!(lineages[0].name, "example.com");
    assert_eq!(lineages[0].domains, vec!["example.com", "www.example.com"]);
    assert_eq!(lineages[0].cert_path, workdir.cert_path("example.com"));
    assert!(lineages[0].not_after > OffsetDateTime::now_utc() + time::Duration::days(41));
}

fn test_config(workdir: &Path) -> CertBotConfig {
    CertBotConfig::builder()
        .acme_url(instant_acme::LetsEncrypt::Staging.url())
        .cf_api_token("unused")
        .workdir(workdir)
        .propagation_delay(Duration::from_secs(1))
        .renew_expires_in(THIRTY_DAYS)
        .build()
}

#[tokio::test]
async fn build_requires_a_domain() {
    let dir = tempfile::tempdir().unwrap();
    let err = test_config(dir.path()).build_bot().await.err().unwrap();
    assert!(err.to_string().contains("no domain configured"));
}

#[tokio::test]
async fn renew_all_skips_lineages_that_are_not_due() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let workdir = config.workdir();
    workdir.prepare().unwrap();
    let cert = self_signed(&["example.com"], time::Duration::days(80));
    workdir.store_cert("example.com", &cert, "KEY").unwrap();

    let results = CertBot::renew_all(&config).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "example.com");
    assert!(matches!(
        results[0].1.as_ref().unwrap(),
        Outcome::NotDue { .. }
    ));
}

#[test]
fn config_debug_hides_token() {
    let config = CertBotConfig::builder()
        .acme_url("https://acme.test/directory")
        .cf_api_token("very-secret")
        .workdir("/tmp/x")
        .propagation_delay(Duration::from_secs(1))
        .renew_expires_in(THIRTY_DAYS)
        .build();
    assert!(!format!("{config:?}").contains("very-secret"));
}

#[tokio::test]
#[ignore = "needs cloudflare credentials and talks to let's encrypt staging"]
async fn test_certbot() {
    tracing_subscriber::fmt::try_init().ok();

    let dir = tempfile::tempdir().unwrap();
    let config = CertBotConfig::builder()
        .acme_url(instant_acme::LetsEncrypt::Staging.url())
        .cf_api_token(std::env::var("CLOUDFLARE_API_TOKEN").expect("CLOUDFLARE_API_TOKEN not set"))
        .maybe_cf_zone_id(std::env::var("CLOUDFLARE_ZONE_ID").ok())
        .workdir(dir.path())
        .domains(vec![std::env::var("TEST_DOMAIN").expect("TEST_DOMAIN not set")])
        .propagation_delay(Duration::from_secs(10))
        .renew_expires_in(THIRTY_DAYS)
        .build();
    let bot = config.build_bot().await.unwrap();
    let outcome = bot.request().await.unwrap();
    assert!(matches!(outcome, Outcome::Issued { .. }));
    // second pass finds the fresh certificate
    let outcome = bot.request().await.unwrap();
    assert!(matches!(outcome, Outcome::NotDue { .. }));
}
