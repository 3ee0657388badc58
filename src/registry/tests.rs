//! Tests for ModelRegistry.

use super::*;
use crate::testing::{code, model_source, pair, Behavior, Fixture, ScriptedLoader};
use std::sync::atomic::Ordering;

fn registry(
    dir: &Path,
    descriptors: Vec<ModelDescriptor>,
    configure: impl FnOnce(&mut RegistryOptions),
) -> (ModelRegistry, Arc<ScriptedLoader>) {
    let mut options = RegistryOptions::new(dir.join("models"));
    options.drain_timeout = Duration::from_secs(5);
    configure(&mut options);
    let loader = Arc::new(ScriptedLoader::default());
    let registry = ModelRegistry::new(
        ModelCatalog::from_descriptors(descriptors),
        Arc::clone(&loader) as Arc<dyn ModelLoader>,
        options,
    )
    .unwrap();
    (registry, loader)
}

// ============================================================================
// Install
// ============================================================================

#[tokio::test]
async fn install_verifies_and_places_model_file() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = model_source(dir.path(), pair("es", "en"), "1.9", b"spanish weights");
    let (registry, _) = registry(dir.path(), vec![descriptor.clone()], |_| {});

    let outcome = registry.install(&descriptor).await.unwrap();

    assert_eq!(outcome, InstallOutcome::Installed);
    let installed = registry.installed_models().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].version, "1.9");
    assert!(installed[0].path.ends_with("es-en-1.9.model"));
}

#[tokio::test]
async fn install_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = model_source(dir.path(), pair("es", "en"), "1.0", b"w");
    let (registry, _) = registry(dir.path(), vec![descriptor.clone()], |_| {});

    registry.install(&descriptor).await.unwrap();
    let second = registry.install(&descriptor).await.unwrap();

    assert_eq!(second, InstallOutcome::AlreadyInstalled);
}

#[tokio::test]
async fn checksum_mismatch_leaves_no_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = model_source(dir.path(), pair("es", "en"), "1.0", b"w");
    descriptor.sha256 = "0".repeat(64);
    let (registry, _) = registry(dir.path(), vec![descriptor.clone()], |_| {});

    let err = registry.install(&descriptor).await.unwrap_err();

    assert!(matches!(err, RegistryError::ChecksumMismatch { .. }));
    assert!(registry.installed_models().await.unwrap().is_empty());
    let leftovers = std::fs::read_dir(dir.path().join("models")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn missing_source_is_download_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = model_source(dir.path(), pair("es", "en"), "1.0", b"w");
    descriptor.source = dir.path().join("nope.bin").display().to_string();
    let (registry, _) = registry(dir.path(), vec![], |_| {});

    let err = registry.install(&descriptor).await.unwrap_err();

    assert_eq!(err.kind(), "download_error");
}

#[tokio::test]
async fn installs_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let body = b"remote weights".to_vec();
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/es-en.model")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let mut descriptor = model_source(dir.path(), pair("es", "en"), "2.0", &body);
    descriptor.source = format!("{}/es-en.model", server.url());
    let (registry, _) = registry(dir.path(), vec![descriptor.clone()], |_| {});

    assert_eq!(registry.install(&descriptor).await.unwrap(), InstallOutcome::Installed);
    mock.assert_async().await;
}

#[tokio::test]
async fn http_error_status_is_download_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/es-en.model")
        .with_status(404)
        .create_async()
        .await;

    let mut descriptor = model_source(dir.path(), pair("es", "en"), "2.0", b"w");
    descriptor.source = format!("{}/es-en.model", server.url());
    let (registry, _) = registry(dir.path(), vec![], |_| {});

    let err = registry.install(&descriptor).await.unwrap_err();
    assert!(matches!(err, RegistryError::Download { .. }));
}

#[tokio::test]
async fn allowlist_skips_install_and_load_reports_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = model_source(dir.path(), pair("es", "en"), "1.0", b"w");
    let (registry, _) = registry(dir.path(), vec![descriptor.clone()], |o| {
        o.allowlist = Some(vec![code("en"), code("fr")]);
    });

    assert_eq!(registry.install(&descriptor).await.unwrap(), InstallOutcome::Skipped);
    let err = registry.load(pair("es", "en")).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotInstalled(_)));
}

#[tokio::test]
async fn update_replaces_older_version_only_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let old = model_source(dir.path(), pair("es", "en"), "1.0", b"old");
    let new = model_source(dir.path(), pair("es", "en"), "1.1", b"new");

    let (registry, _) = registry(dir.path(), vec![], |_| {});
    registry.install(&old).await.unwrap();
    assert_eq!(registry.install(&new).await.unwrap(), InstallOutcome::AlreadyInstalled);

    let (updating, _) = registry_with_dir(dir.path(), |o| o.update_models = true);
    assert_eq!(updating.install(&new).await.unwrap(), InstallOutcome::Installed);
    let installed = updating.installed_models().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].version, "1.1");
    assert!(!dir.path().join("models/es-en-1.0.model").exists());
}

fn registry_with_dir(
    dir: &Path,
    configure: impl FnOnce(&mut RegistryOptions),
) -> (ModelRegistry, Arc<ScriptedLoader>) {
    registry(dir, vec![], configure)
}

#[tokio::test]
async fn install_pair_rejects_models_missing_from_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(dir.path(), vec![], |_| {});

    let err = registry.install_pair(pair("es", "en")).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownModel(_)));
}

// ============================================================================
// Load / unload
// ============================================================================

#[tokio::test]
async fn load_unload_load_restores_loaded_state() {
    let fixture = Fixture::with_pairs(&[("es", "en")]).await;
    let registry = &fixture.registry;
    let es_en = pair("es", "en");

    assert!(registry.is_loaded(es_en));
    registry.load(es_en).await.unwrap();
    assert_eq!(fixture.loader.loads.load(Ordering::SeqCst), 1);

    registry.unload(es_en).await.unwrap();
    assert!(!registry.is_loaded(es_en));
    assert_eq!(fixture.loader.releases.load(Ordering::SeqCst), 1);

    registry.load(es_en).await.unwrap();
    assert!(registry.is_loaded(es_en));
    assert_eq!(registry.loaded_pairs(), vec![es_en]);
}

#[tokio::test]
async fn unload_of_unloaded_pair_fails() {
    let fixture = Fixture::with_pairs(&[]).await;
    let err = fixture.registry.unload(pair("es", "en")).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotLoaded(_)));
}

#[tokio::test]
async fn memory_budget_bounds_loaded_models() {
    let fixture = Fixture::build(&[("es", "en")], |o| o.memory_budget_bytes = Some(10)).await;
    let extra = model_source(fixture.dir.path(), pair("en", "fr"), "1.0", b"0123456789");
    fixture.registry.install(&extra).await.unwrap();

    let err = fixture.registry.load(pair("en", "fr")).await.unwrap_err();

    assert!(matches!(err, RegistryError::OutOfMemory { .. }));
    assert!(!fixture.registry.is_loaded(pair("en", "fr")));
}

#[tokio::test]
async fn backend_out_of_memory_is_reported() {
    let fixture = Fixture::with_pairs(&[]).await;
    let descriptor = model_source(fixture.dir.path(), pair("es", "en"), "1.0", b"w");
    fixture.registry.install(&descriptor).await.unwrap();
    fixture.loader.refuse_memory(pair("es", "en"));

    let err = fixture.registry.load(pair("es", "en")).await.unwrap_err();
    assert_eq!(err.kind(), "out_of_memory");
}

#[tokio::test]
async fn lease_is_refused_for_missing_model() {
    let fixture = Fixture::with_pairs(&[("es", "en")]).await;
    assert!(fixture.registry.lease(pair("es", "en")).is_some());
    assert!(fixture.registry.lease(pair("en", "es")).is_none());
}

#[tokio::test]
async fn unload_waits_for_in_flight_leases() {
    let fixture = Fixture::with_pairs(&[("es", "en")]).await;
    let es_en = pair("es", "en");
    let lease = fixture.registry.lease(es_en).unwrap();

    let registry = Arc::clone(&fixture.registry);
    let unload = tokio::spawn(async move { registry.unload(es_en).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!unload.is_finished());
    assert!(!fixture.registry.is_loaded(es_en));
    assert!(fixture.registry.lease(es_en).is_none());
    assert_eq!(fixture.loader.releases.load(Ordering::SeqCst), 0);

    let text = lease
        .translator()
        .translate("Hola", code("es"), code("en"))
        .await
        .unwrap();
    assert_eq!(text, "Hello");
    drop(lease);

    unload.await.unwrap().unwrap();
    assert_eq!(fixture.loader.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn drain_timeout_bounds_unload() {
    let fixture = Fixture::build(&[("es", "en")], |o| {
        o.drain_timeout = Duration::from_millis(50);
    })
    .await;
    let _lease = fixture.registry.lease(pair("es", "en")).unwrap();

    fixture.registry.unload(pair("es", "en")).await.unwrap();

    assert_eq!(fixture.loader.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unload_all_empties_the_table() {
    let fixture = Fixture::with_pairs(&[("es", "en"), ("en", "fr")]).await;
    fixture.registry.unload_all().await;
    assert!(fixture.registry.loaded_pairs().is_empty());
    assert_eq!(fixture.loader.releases.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn list_models_reports_state() {
    let fixture = Fixture::with_pairs(&[("es", "en")]).await;
    let statuses = fixture.registry.list_models().await.unwrap();

    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].loaded);
    assert_eq!(statuses[0].installed_version.as_deref(), Some("1.0"));
    assert_eq!(statuses[0].in_flight, 0);
}

// ============================================================================
// Boot
// ============================================================================

#[tokio::test]
async fn boot_collects_failures_without_aborting() {
    let dir = tempfile::tempdir().unwrap();
    let good = model_source(dir.path(), pair("es", "en"), "1.0", b"good");
    let mut bad = model_source(dir.path(), pair("en", "fr"), "1.0", b"bad");
    bad.sha256 = "f".repeat(64);
    let skipped = model_source(dir.path(), pair("ja", "en"), "1.0", b"ja");
    let (registry, _) = registry(dir.path(), vec![good, bad, skipped], |o| {
        o.allowlist = Some(vec![code("en"), code("es"), code("fr")]);
    });

    let report = registry.boot().await;

    assert_eq!(report.installed, vec![pair("es", "en")]);
    assert_eq!(report.loaded, vec![pair("es", "en")]);
    assert_eq!(report.skipped, vec![pair("ja", "en")]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].pair, Some(pair("en", "fr")));
    assert_eq!(report.failures[0].kind, "checksum_mismatch");
}

#[tokio::test]
async fn boot_loads_models_already_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = model_source(dir.path(), pair("es", "en"), "1.0", b"w");
    let (first, _) = registry(dir.path(), vec![descriptor.clone()], |_| {});
    first.install(&descriptor).await.unwrap();

    let (second, loader) = registry(dir.path(), vec![], |_| {});
    let report = second.boot().await;

    assert!(report.failures.is_empty());
    assert_eq!(report.loaded, vec![pair("es", "en")]);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_model_still_loads() {
    let fixture = Fixture::with_pairs(&[]).await;
    fixture
        .loader
        .set(pair("es", "en"), Behavior::Fail("broken".to_string()));
    let descriptor = model_source(fixture.dir.path(), pair("es", "en"), "1.0", b"w");
    fixture.registry.install(&descriptor).await.unwrap();

    fixture.registry.load(pair("es", "en")).await.unwrap();
    let lease = fixture.registry.lease(pair("es", "en")).unwrap();
    let err = lease
        .translator()
        .translate("Hola", code("es"), code("en"))
        .await
        .unwrap_err();
    assert_eq!(err, InferenceError::Failed("broken".to_string()));
}

#[test]
fn parses_model_file_names() {
    assert_eq!(
        parse_model_file_name(Path::new("/m/es-en-1.9.model")),
        Some((pair("es", "en"), "1.9".to_string()))
    );
    assert_eq!(
        parse_model_file_name(Path::new("/m/en-zt-2.0-rc1.model")),
        Some((pair("en", "zt"), "2.0-rc1".to_string()))
    );
    assert_eq!(parse_model_file_name(Path::new("/m/es-en-1.9.model.part")), None);
    assert_eq!(parse_model_file_name(Path::new("/m/index.json")), None);
}
