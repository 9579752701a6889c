//! Deploy, redeploy and undeploy of single artifacts through the service.

mod common;

use std::time::Duration;

use berth_core::{ArtifactState, DeployError, RuntimePhase};
use berth_repo::ArtifactKind;
use common::{application, application_in, domain, eventually, Behaviour, Harness};
use serde_json::json;

const APP: ArtifactKind = ArtifactKind::Application;

// -------------------------------------------------------------------------
// Deploy / undeploy
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_deploy_and_undeploy_application() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));

    h.deploy(APP, "shop").await;
    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Deployed));
    assert!(h.repo().has_anchor(APP, "shop"));
    assert_eq!(h.service.applications().len(), 1);
    assert_eq!(h.builder.stats("shop").live(), 1);

    h.service.undeploy(APP, "shop").await.expect("undeploy");
    assert_eq!(h.service.state(APP, "shop"), None);
    assert!(!h.repo().exists(APP, "shop"));
    assert!(!h.repo().has_anchor(APP, "shop"));

    let stats = h.builder.stats("shop");
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.count(RuntimePhase::Stop), 1);
    assert_eq!(stats.count(RuntimePhase::Dispose), 1);
    assert_eq!(
        h.labels(),
        vec![
            "shop:deploy:start",
            "shop:deploy:success",
            "shop:undeploy:start",
            "shop:undeploy:success",
        ]
    );

    let metrics = h.service.metrics().snapshot();
    assert_eq!(metrics.deployments, 1);
    assert_eq!(metrics.undeployments, 1);
}

#[tokio::test]
async fn test_uninstall_removes_data_folder() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;

    let data = h.service.data_dir("shop");
    std::fs::create_dir_all(&data).expect("data dir");
    std::fs::write(data.join("orders.db"), "x").expect("data file");

    h.service.undeploy(APP, "shop").await.expect("undeploy");
    assert!(eventually(Duration::from_secs(5), || !data.exists()).await);
}

#[tokio::test]
async fn test_undeploy_unknown_artifact_is_not_deployed() {
    let h = Harness::new();
    let err = h.service.undeploy(APP, "ghost").await.unwrap_err();
    assert!(matches!(*err, DeployError::NotDeployed { .. }));

    let err = h.service.redeploy(APP, "ghost").await.unwrap_err();
    assert!(matches!(*err, DeployError::NotDeployed { .. }));
}

// -------------------------------------------------------------------------
// Redeploy
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_redeploy_is_undeploy_then_deploy_with_fresh_context() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;
    let before = h.service.find(APP, "shop").expect("record").context;
    h.events.clear();

    h.service.redeploy(APP, "shop").await.expect("redeploy");

    assert_eq!(
        h.labels(),
        vec![
            "shop:undeploy:start",
            "shop:undeploy:success",
            "shop:deploy:start",
            "shop:deploy:success",
        ]
    );
    let after = h.service.find(APP, "shop").expect("record").context;
    assert!(after.is_some());
    assert_ne!(before, after);
    // files survive a redeploy
    assert!(h.repo().exists(APP, "shop"));
    assert_eq!(h.service.metrics().snapshot().redeployments, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redeploys_never_overlap() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                service.redeploy(APP, "shop").await
            } else {
                service.deploy(APP, "shop").await
            }
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("redeploy");
    }

    let stats = h.builder.stats("shop");
    assert_eq!(stats.max_live(), 1);
    assert_eq!(stats.live(), 1);
    assert_eq!(stats.count(RuntimePhase::Start), 17);
    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Deployed));

    let live: Vec<_> = h
        .service
        .contexts()
        .live()
        .into_iter()
        .filter(|c| c.artifact == "shop")
        .collect();
    assert_eq!(live.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removal_check_waits_for_redeploy_in_flight() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;
    assert!(h.repo().has_anchor(APP, "shop"));
    h.builder.set("shop", Behaviour::SlowStart(Duration::from_millis(300)));

    let service = h.service.clone();
    let redeploy = tokio::spawn(async move { service.redeploy(APP, "shop").await });
    assert!(
        eventually(Duration::from_secs(2), || {
            h.service.state(APP, "shop") == Some(ArtifactState::Deploying)
        })
        .await
    );
    // the anchor is gone while the new instance starts
    assert!(!h.repo().has_anchor(APP, "shop"));

    assert!(h.service.undeploy_if_removed(APP, "shop").await.is_none());
    redeploy.await.expect("join").expect("redeploy");

    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Deployed));
    assert!(h.repo().exists(APP, "shop"));
    assert!(h.repo().has_anchor(APP, "shop"));
    assert_eq!(h.builder.stats("shop").live(), 1);
}

#[tokio::test]
async fn test_missing_anchor_undeploys_and_uninstalls() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;
    h.repo().remove_anchor(APP, "shop").expect("remove anchor");

    let result = h.service.undeploy_if_removed(APP, "shop").await;

    assert!(matches!(result, Some(Ok(()))));
    assert_eq!(h.service.state(APP, "shop"), None);
    assert!(!h.repo().exists(APP, "shop"));
    // nothing left to check the second time
    assert!(h.service.undeploy_if_removed(APP, "shop").await.is_none());
}

// -------------------------------------------------------------------------
// Failures and zombies
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_init_failure_leaves_zombie_and_releases_context() {
    let h = Harness::new();
    h.builder.set("shop", Behaviour::FailInit);
    h.write(APP, "shop", &application("shop", "1.0.0"));

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        *err,
        DeployError::Runtime {
            phase: RuntimePhase::Init,
            ..
        }
    ));

    let record = h.service.find(APP, "shop").expect("zombie record");
    assert_eq!(record.state, ArtifactState::Failed);
    assert!(record.context.is_none());
    assert!(record.cause.is_some());
    assert!(!h.repo().has_anchor(APP, "shop"));

    let zombies = h.service.zombies();
    assert_eq!(zombies.len(), 1);
    assert_eq!(zombies[0].artifact, "shop");
    assert!(!h.service.is_updated_zombie(APP, "shop"));

    // never started, so only disposed
    let stats = h.builder.stats("shop");
    assert_eq!(stats.count(RuntimePhase::Stop), 0);
    assert_eq!(stats.count(RuntimePhase::Dispose), 1);
    assert!(h.service.contexts().live().is_empty());

    assert_eq!(h.labels(), vec!["shop:deploy:start", "shop:deploy:failure"]);
    assert_eq!(h.service.metrics().snapshot().deployment_failures, 1);
}

#[tokio::test]
async fn test_start_failure_stops_and_disposes() {
    let h = Harness::new();
    h.builder.set("shop", Behaviour::FailStart);
    h.write(APP, "shop", &application("shop", "1.0.0"));

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        *err,
        DeployError::Runtime {
            phase: RuntimePhase::Start,
            ..
        }
    ));
    let stats = h.builder.stats("shop");
    assert_eq!(stats.count(RuntimePhase::Stop), 1);
    assert_eq!(stats.count(RuntimePhase::Dispose), 1);
}

#[tokio::test]
async fn test_hanging_start_times_out() {
    let h = Harness::with_config(|c| c.lifecycle.step_timeout_ms = 100);
    h.builder.set("shop", Behaviour::HangStart);
    h.write(APP, "shop", &application("shop", "1.0.0"));

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    match &*err {
        DeployError::Timeout {
            phase, limit_ms, ..
        } => {
            assert_eq!(*phase, RuntimePhase::Start);
            assert_eq!(*limit_ms, 100);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.service.state(APP, "shop"), Some(ArtifactState::Failed));
    assert!(h.service.contexts().live().is_empty());
}

#[tokio::test]
async fn test_failed_artifact_recovers_on_redeploy() {
    let h = Harness::new();
    h.builder.set("shop", Behaviour::FailInit);
    h.write(APP, "shop", &application("shop", "1.0.0"));
    assert!(h.service.deploy(APP, "shop").await.is_err());

    h.builder.set("shop", Behaviour::Normal);
    h.service.redeploy(APP, "shop").await.expect("redeploy");

    let record = h.service.find(APP, "shop").expect("record");
    assert_eq!(record.state, ArtifactState::Deployed);
    assert!(record.cause.is_none());
    assert!(h.service.zombies().is_empty());
    // the failed record was never live, so no undeploy events
    assert_eq!(
        h.labels(),
        vec![
            "shop:deploy:start",
            "shop:deploy:failure",
            "shop:deploy:start",
            "shop:deploy:success",
        ]
    );
}

#[tokio::test]
async fn test_unparseable_descriptor_registers_zombie_without_record() {
    let h = Harness::new();
    h.write_raw(APP, "shop", "{ not json");

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(*err, DeployError::Parse(_)));
    assert_eq!(h.service.state(APP, "shop"), None);
    assert_eq!(h.service.zombies().len(), 1);
    assert_eq!(h.labels(), vec!["shop:deploy:start", "shop:deploy:failure"]);
}

#[tokio::test]
async fn test_kind_mismatch_is_rejected() {
    let h = Harness::new();
    h.write(APP, "shared", &domain("shared", "1.0.0"));

    let err = h.service.deploy(APP, "shared").await.unwrap_err();
    assert!(matches!(
        *err,
        DeployError::KindMismatch {
            found: ArtifactKind::Domain,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stop_failure_on_undeploy_is_reported() {
    let h = Harness::new();
    h.builder.set("shop", Behaviour::FailStop);
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;

    let err = h.service.undeploy(APP, "shop").await.unwrap_err();
    assert!(matches!(
        *err,
        DeployError::Runtime {
            phase: RuntimePhase::Stop,
            ..
        }
    ));
    // explicit undeploy still forgets the record and its files
    assert_eq!(h.service.state(APP, "shop"), None);
    assert!(!h.repo().exists(APP, "shop"));
    assert_eq!(
        h.labels().last().map(String::as_str),
        Some("shop:undeploy:failure")
    );
}

#[tokio::test]
async fn test_min_runtime_version_is_enforced() {
    let h = Harness::new();
    let mut app = application("shop", "1.0.0");
    app["min_runtime_version"] = json!("99.0.0");
    h.write(APP, "shop", &app);

    let err = h.service.deploy(APP, "shop").await.unwrap_err();
    assert!(matches!(*err, DeployError::RuntimeVersion { .. }));
    assert_eq!(h.builder.stats("shop").count(RuntimePhase::Build), 0);

    let mut app = application("cart", "1.0.0");
    app["min_runtime_version"] = json!("0.0.1");
    h.write(APP, "cart", &app);
    h.deploy(APP, "cart").await;
}

// -------------------------------------------------------------------------
// Slots
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_patch_version_under_same_name_is_a_redeploy() {
    let h = Harness::new();
    h.write(APP, "shop", &application("shop", "1.0.0"));
    h.deploy(APP, "shop").await;

    h.write(APP, "shop", &application("shop", "1.0.1"));
    h.deploy(APP, "shop").await;

    let record = h.service.find(APP, "shop").expect("record");
    assert_eq!(record.state, ArtifactState::Deployed);
    assert_eq!(record.coordinate.version.to_string(), "1.0.1");
    assert!(h.repo().exists(APP, "shop"));
    let stats = h.builder.stats("shop");
    assert_eq!(stats.live(), 1);
    assert_eq!(stats.max_live(), 1);
}

#[tokio::test]
async fn test_differently_named_patch_versions_coexist() {
    let h = Harness::new();
    h.write(APP, "shop-100", &application("shop", "1.0.0"));
    h.write(APP, "shop-101", &application("shop", "1.0.1"));
    h.deploy(APP, "shop-100").await;
    h.deploy(APP, "shop-101").await;

    for name in ["shop-100", "shop-101"] {
        assert_eq!(h.service.state(APP, name), Some(ArtifactState::Deployed));
        assert!(h.repo().exists(APP, name));
        assert_eq!(h.builder.stats(name).live(), 1);
    }
    assert_eq!(h.service.applications().len(), 2);
    assert!(!h.labels().iter().any(|l| l.starts_with("shop-100:undeploy")));
}

#[tokio::test]
async fn test_minor_versions_deploy_side_by_side() {
    let h = Harness::new();
    h.write(APP, "shop-1.0", &application("shop", "1.0.0"));
    h.write(APP, "shop-1.1", &application("shop", "1.1.0"));
    h.deploy(APP, "shop-1.0").await;
    h.deploy(APP, "shop-1.1").await;

    assert_eq!(h.service.applications().len(), 2);
}

// -------------------------------------------------------------------------
// Shutdown
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_stops_applications_before_domains_and_keeps_files() {
    let h = Harness::new();
    h.write(ArtifactKind::Domain, "shared", &domain("shared", "1.0.0"));
    h.write(APP, "shop", &application_in("shop", "1.0.0", "shared", None));
    h.write(APP, "cart", &application_in("cart", "1.0.0", "shared", None));
    h.deploy(ArtifactKind::Domain, "shared").await;
    h.deploy(APP, "shop").await;
    h.deploy(APP, "cart").await;
    h.events.clear();

    h.service.shutdown().await;

    assert_eq!(
        h.labels(),
        vec![
            "cart:undeploy:start",
            "cart:undeploy:success",
            "shop:undeploy:start",
            "shop:undeploy:success",
            "shared:undeploy:start",
            "shared:undeploy:success",
        ]
    );
    assert!(h.service.applications().is_empty());
    assert!(h.service.domains().is_empty());
    assert!(h.repo().exists(APP, "shop"));
    assert!(h.repo().exists(ArtifactKind::Domain, "shared"));
}
