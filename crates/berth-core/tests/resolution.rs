//! Binding applications to deployed domains.

mod common;

use berth_core::{ArtifactState, DeployError, ResolutionError};
use berth_repo::ArtifactKind;
use common::{application, application_exact, application_in, domain, Behaviour, Harness};

const APP: ArtifactKind = ArtifactKind::Application;
const DOMAIN: ArtifactKind = ArtifactKind::Domain;

fn resolution_error(err: &DeployError) -> &ResolutionError {
    match err {
        DeployError::Resolution { source, .. } => source,
        other => panic!("expected a resolution error, got: {other}"),
    }
}

#[tokio::test]
async fn test_named_reference_binds_single_domain() {
    let h = Harness::new();
    h.write(DOMAIN, "shared", &domain("shared", "1.2.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", Some("1.2.5")));
    h.deploy(DOMAIN, "shared").await;
    h.deploy(APP, "shop").await;

    let shop = h.service.find(APP, "shop").expect("record");
    assert_eq!(shop.state, ArtifactState::Deployed);
    assert_eq!(shop.domain.as_deref(), Some("shared"));
}

#[tokio::test]
async fn test_exact_reference_picks_matching_version() {
    let h = Harness::new();
    h.write(DOMAIN, "shared-a", &domain("shared", "1.0.0"));
    h.write(DOMAIN, "shared-b", &domain("shared", "1.1.0"));
    h.write(APP, "shop", &application_exact("shop", "1.0.0", "shared", "1.1.0"));
    h.deploy(DOMAIN, "shared-a").await;
    h.deploy(DOMAIN, "shared-b").await;

    h.deploy(APP, "shop").await;
    let shop = h.service.find(APP, "shop").expect("record");
    assert_eq!(shop.domain.as_deref(), Some("shared-b"));
}

#[tokio::test]
async fn test_exact_reference_never_substitutes() {
    let h = Harness::new();
    h.write(DOMAIN, "shared", &domain("shared", "1.0.1"));
    h.write(APP, "shop", &application_exact("shop", "1.0.0", "shared", "1.0.0"));
    h.deploy(DOMAIN, "shared").await;

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        resolution_error(&err),
        ResolutionError::NotFound { .. }
    ));
    assert!(err.is_resolution());
    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Failed));
}

#[tokio::test]
async fn test_two_compatible_domains_are_ambiguous() {
    let h = Harness::new();
    h.write(DOMAIN, "shared-a", &domain("shared", "1.0.0"));
    h.write(DOMAIN, "shared-b", &domain("shared", "1.1.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));
    h.deploy(DOMAIN, "shared-a").await;
    h.deploy(DOMAIN, "shared-b").await;

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    match resolution_error(&err) {
        ResolutionError::Ambiguous { candidates, .. } => {
            assert_eq!(candidates, &vec!["shared-a".to_string(), "shared-b".to_string()]);
        }
        other => panic!("unexpected resolution error: {other:?}"),
    }
    // nothing was built for an unresolved application
    assert_eq!(
        h.builder.stats("shop").count(berth_core::RuntimePhase::Build),
        0
    );
}

#[tokio::test]
async fn test_patch_versions_of_one_domain_stay_deployed_side_by_side() {
    let h = Harness::new();
    h.write(DOMAIN, "shared-100", &domain("shared", "1.0.0"));
    h.write(DOMAIN, "shared-101", &domain("shared", "1.0.1"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", Some("1.0.0")));
    h.write(APP, "cart", &application_exact("cart", "1.0.0", "shared", "1.0.0"));
    h.deploy(DOMAIN, "shared-100").await;
    h.deploy(DOMAIN, "shared-101").await;

    for name in ["shared-100", "shared-101"] {
        assert_eq!(h.service.state(DOMAIN, name), Some(ArtifactState::Deployed));
        assert!(h.repo().exists(DOMAIN, name));
    }

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    match resolution_error(&err) {
        ResolutionError::Ambiguous { candidates, .. } => {
            assert_eq!(candidates, &vec!["shared-100".to_string(), "shared-101".to_string()]);
        }
        other => panic!("unexpected resolution error: {other:?}"),
    }

    h.deploy(APP, "cart").await;
    let cart = h.service.find(APP, "cart").expect("record");
    assert_eq!(cart.domain.as_deref(), Some("shared-100"));
}

#[tokio::test]
async fn test_missing_domain_is_not_found() {
    let h = Harness::new();
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        resolution_error(&err),
        ResolutionError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_incompatible_minor_is_reported() {
    let h = Harness::new();
    h.write(DOMAIN, "shared", &domain("shared", "1.0.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", Some("1.3.0")));
    h.deploy(DOMAIN, "shared").await;

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    match resolution_error(&err) {
        ResolutionError::IncompatibleVersion { available, .. } => {
            assert_eq!(available, &vec!["org.acme:shared:1.0.0".to_string()]);
        }
        other => panic!("unexpected resolution error: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_domain_surfaces_as_domain_failure() {
    let h = Harness::new();
    h.builder.set("shared", Behaviour::FailInit);
    h.write(DOMAIN, "shared", &domain("shared", "1.0.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));
    assert!(h.service.deploy(DOMAIN, "shared").await.is_err());

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    match &*err {
        DeployError::DomainFailed { domain, cause, .. } => {
            assert_eq!(domain, "shared");
            assert!(matches!(**cause, DeployError::Runtime { .. }));
        }
        other => panic!("expected a domain failure, got: {other}"),
    }
    assert!(err.is_resolution());
    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Failed));
}

#[tokio::test]
async fn test_unparseable_domain_surfaces_as_domain_failure() {
    let h = Harness::new();
    h.write_raw(DOMAIN, "shared", "{");
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));
    assert!(h.service.deploy(DOMAIN, "shared").await.is_err());

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        &*err,
        DeployError::DomainFailed { domain, .. } if domain == "shared"
    ));
}

#[tokio::test]
async fn test_recovered_domain_brings_waiting_applications_up() {
    let h = Harness::new();
    h.builder.set("shared", Behaviour::FailInit);
    h.write(DOMAIN, "shared", &domain("shared", "1.0.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));
    h.write(APP, "cart", &application("cart", "1.0.0"));
    assert!(h.service.deploy(DOMAIN, "shared").await.is_err());
    assert!(h.service.deploy(APP, "shop").await.is_err());
    h.deploy(APP, "cart").await;

    h.builder.set("shared", Behaviour::Normal);
    h.service.redeploy(DOMAIN, "shared").await.expect("redeploy domain");

    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Deployed));
    assert_eq!(
        h.service.find(APP, "shop").and_then(|s| s.domain),
        Some("shared".to_string())
    );
    assert!(h.service.zombies().is_empty());
    // unbound applications are left alone
    assert_eq!(h.builder.stats("cart").count(berth_core::RuntimePhase::Start), 1);
}
