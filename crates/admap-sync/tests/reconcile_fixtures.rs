use std::path::PathBuf;

use admap_core::Tier;
use admap_sync::{
    report_recent_markdown, run_reconcile, ConfigError, DiagnosticKind, ReconcileError, RunOptions,
    SyncConfig, UnresolvedReason,
};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn config(reports_dir: PathBuf) -> SyncConfig {
    SyncConfig {
        providers_file: workspace_root().join("providers.yaml"),
        reports_dir,
        ..SyncConfig::default()
    }
}

fn offline(provider: &str) -> RunOptions {
    let root = workspace_root();
    RunOptions {
        provider: Some(provider.to_string()),
        fixture: Some(root.join("fixtures/ghn_sample.json")),
        canonical: Some(root.join("fixtures/canonical_sample.json")),
        dry_run: true,
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn offline_dry_run_reconciles_sample_and_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (report, run_dir) = run_reconcile(&config(dir.path().to_path_buf()), offline("ghn"))
        .await
        .unwrap();

    assert_eq!(report.provider_code, "ghn");
    assert_eq!(report.provider_id, 1);
    assert_eq!(report.counts(Tier::Province).resolved, 3);
    let districts = report.counts(Tier::District);
    assert_eq!((districts.fetched, districts.resolved, districts.unresolved), (6, 5, 1));
    let wards = report.counts(Tier::Ward);
    assert_eq!((wards.fetched, wards.resolved, wards.unresolved), (8, 7, 1));
    assert_eq!(report.mappings.len(), 15);

    let reasons = report
        .unresolved
        .iter()
        .map(|u| (u.provider_code.as_str(), u.reason))
        .collect::<Vec<_>>();
    assert!(reasons.contains(&("2264", UnresolvedReason::EmptyScope)));
    assert!(reasons.contains(&("20199", UnresolvedReason::NoMatch)));
    assert_eq!(report.diagnostics_of(DiagnosticKind::EmptyScope).count(), 1);

    let cu_chi = report
        .mappings
        .iter()
        .find(|m| m.tier == Tier::Ward && m.provider_code.as_str() == "20601")
        .unwrap();
    assert_eq!(cu_chi.canonical_id, 27595);

    for file in [
        "summary.md",
        "reconcile_report.json",
        "mappings.parquet",
        "unresolved.parquet",
        "manifest.json",
    ] {
        assert!(run_dir.join(file).is_file(), "{file} missing");
    }
    assert!(run_dir.starts_with(dir.path()));
}

#[tokio::test]
async fn repeated_runs_produce_the_same_digest() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().to_path_buf());
    let (first, _) = run_reconcile(&config, offline("ghn")).await.unwrap();
    let (second, _) = run_reconcile(&config, offline("GHN")).await.unwrap();

    assert_eq!(first.mapping_digest, second.mapping_digest);
    assert_eq!(first.mapping_digest.len(), 64);

    let markdown = report_recent_markdown(5, dir.path()).unwrap();
    assert!(markdown.contains(&first.run_id.to_string()));
    assert!(markdown.contains(&second.run_id.to_string()));
}

#[tokio::test]
async fn disabled_provider_is_rejected_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_reconcile(&config(dir.path().to_path_buf()), offline("vtp"))
        .await
        .unwrap_err();

    match err.downcast_ref::<ReconcileError>() {
        Some(ReconcileError::Config(ConfigError::DisabledProvider(code))) => {
            assert_eq!(code, "vtp")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unknown_provider_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = run_reconcile(&config(dir.path().to_path_buf()), offline("jnt"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReconcileError>(),
        Some(ReconcileError::Config(ConfigError::UnknownProvider(_)))
    ));
}
