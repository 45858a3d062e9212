use super::*;

fn self_signed(names: &[&str], valid_for: time::Duration) -> String {
    let key = KeyPair::generate().unwrap();
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let mut params = CertificateParams::new(names).unwrap();
    params.not_after = time::OffsetDateTime::now_utc() + valid_for;
    params.self_signed(&key).unwrap().pem()
}

#[test]
fn renew_window() {
    let cert = self_signed(&["example.com"], time::Duration::days(5));
    assert!(need_renew(&cert, Duration::from_secs(30 * 24 * 3600)).unwrap());
    assert!(!need_renew(&cert, Duration::from_secs(24 * 3600)).unwrap());

    let cert = self_signed(&["example.com"], time::Duration::days(90));
    assert!(!need_renew(&cert, Duration::from_secs(30 * 24 * 3600)).unwrap());
}

#[test]
fn renew_window_past_date_range_needs_renewal() {
    let cert = self_signed(&["example.com"], time::Duration::days(90));
    assert!(need_renew(&cert, Duration::from_secs(1_000_000_000 * 86400)).unwrap());
    assert!(need_renew(&cert, Duration::MAX).unwrap());
}

#[tokio::test]
async fn timed_out_order_keeps_created_challenges() {
    let mut created = Vec::new();
    let result = within(Duration::from_millis(20), async {
        created.push("_acme-challenge.example.com");
        std::future::pending::<Result<()>>().await
    })
    .await;
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("timed out"));
    assert_eq!(created, vec!["_acme-challenge.example.com"]);
}

#[tokio::test]
async fn order_within_limit_passes_result_through() {
    let value = within(Duration::from_secs(5), async { Ok(7) }).await.unwrap();
    assert_eq!(value, 7);
    let err = within(Duration::from_secs(5), async {
        Err::<(), _>(anyhow::anyhow!("order invalid"))
    })
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "order invalid");
}

#[test]
fn not_after_is_read_from_leaf() {
    let cert = self_signed(&["example.com"], time::Duration::days(10));
    let not_after = cert_not_after(&cert).unwrap();
    let remaining = not_after - time::OffsetDateTime::now_utc();
    assert!(remaining > time::Duration::days(9));
    assert!(remaining <= time::Duration::days(10));
}

#[test]
fn subject_alt_names() {
    let cert = self_signed(&["example.com", "*.example.com"], time::Duration::days(1));
    assert_eq!(
        extract_subject_alt_names(&cert).unwrap(),
        vec!["example.com", "*.example.com"]
    );
}

#[test]
fn garbage_pem_is_rejected() {
    assert!(read_pem("not a certificate").is_err());
    assert!(need_renew("", Duration::ZERO).is_err());
}

#[test]
fn csr_from_key() {
    let key = KeyPair::generate().unwrap();
    let csr = make_csr(&key.serialize_pem(), &["example.com".to_string()]).unwrap();
    // DER SEQUENCE
    assert_eq!(csr[0], 0x30);
    assert!(make_csr("bogus", &["example.com".to_string()]).is_err());
}

async fn new_acme_client() -> Result<AcmeClient> {
    let dns01_client = Dns01Client::new_cloudflare(
        std::env::var("CLOUDFLARE_ZONE_ID").expect("CLOUDFLARE_ZONE_ID not set"),
        std::env::var("CLOUDFLARE_API_TOKEN").expect("CLOUDFLARE_API_TOKEN not set"),
    );
    AcmeClient::new_account(
        instant_acme::LetsEncrypt::Staging.url(),
        None,
        dns01_client,
    )
    .await
}

#[tokio::test]
#[ignore = "needs cloudflare credentials and talks to let's encrypt staging"]
async fn test_request_new_certificate() {
    tracing_subscriber::fmt::try_init().ok();

    let test_domain = std::env::var("TEST_DOMAIN").expect("TEST_DOMAIN not set");
    let domains = vec![test_domain.clone(), format!("*.{}", test_domain)];
    let bot = new_acme_client().await.unwrap();
    println!("account id: {}", bot.account_id());
    let key = KeyPair::generate().unwrap();
    let key_pem = key.serialize_pem();
    let cert = bot
        .request_new_certificate(&key_pem, &domains)
        .await
        .expect("Failed to get cert");
    assert_eq!(extract_subject_alt_names(&cert).unwrap().len(), 2);
    println!("cert:\n{}", cert);
}
