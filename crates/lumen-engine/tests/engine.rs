mod common;

use common::{FakeAssets, FakeHost};
use crossbeam_channel::bounded;
use lumen_engine::host::AssetKind;
use lumen_engine::persistence::{shared, MemoryStore};
use lumen_engine::requests::StateForm;
use lumen_engine::{BuildError, Engine, EngineConfig, EngineError, LoadRequest, RunState};
use lumen_events::{AssetId, EnableDisableFlag, EventKind, ItemId, PostedEvent, StopScriptReason};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const GREETER: &str = "\
@state default
@on state_entry
    say entered
";

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn engine(dir: &TempDir, store: MemoryStore) -> (Engine, Arc<FakeHost>, ItemId) {
    let host = Arc::new(FakeHost::default());
    let assets = Arc::new(FakeAssets::default());
    let asset = AssetId::from_source(GREETER);
    assets.insert(asset, AssetKind::ScriptSource, GREETER.as_bytes());
    let item = ItemId::new_v4();
    host.add_item(7, item, asset);

    let engine = Engine::builder()
        .with_config(EngineConfig::rooted_at(dir.path()))
        .with_host(host.clone())
        .with_assets(assets)
        .with_store(shared(store))
        .build()
        .unwrap();
    (engine, host, item)
}

#[test]
fn test_builder_requires_host_and_assets() {
    assert!(matches!(
        Engine::builder().build(),
        Err(BuildError::MissingHost)
    ));
    assert!(matches!(
        Engine::builder()
            .with_host(Arc::new(FakeHost::default()))
            .build(),
        Err(BuildError::MissingAssets)
    ));
}

#[test]
fn test_engine_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let (mut engine, _host, item) = engine(&dir, store.clone());

    assert!(matches!(engine.stop(), Err(EngineError::NotRunning)));
    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));

    let (tx, rx) = bounded(1);
    engine.post_load_unload_request(
        LoadRequest::load(item, 7).on_complete(move |_, result| {
            let _ = tx.send(result.is_ok());
        }),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));

    wait_for(|| {
        engine
            .script_running(item)
            .is_some_and(|info| info.run_state == RunState::Waiting)
    });
    engine.post_object_event(7, PostedEvent::new(EventKind::TouchStart));

    let details = engine.enabled_details(vec![item]);
    assert_eq!(details.len(), 1);
    engine.change_enabled_status(item, EnableDisableFlag::GeneralDisable);
    wait_for(|| !engine.enabled_details(vec![item])[0].general_enable);

    let data = engine.request_state_data_blocking(item, StateForm::Serialized, StopScriptReason::None);
    assert!(data.snapshot.is_some());
    let missing = engine.request_state_data_blocking(
        ItemId::new_v4(),
        StateForm::Raw,
        StopScriptReason::None,
    );
    assert!(missing.snapshot.is_none());

    let units = engine.retrieve_bytecode(vec![AssetId::from_source(GREETER)]);
    assert_eq!(units.len(), 1);

    assert!(!engine.is_terminated());
    let stats = engine.stop().unwrap();
    assert_eq!(stats.resident_instances, 1);
    assert_eq!(stats.compilations, 1);
    assert!(store.contains(item));
    assert!(!engine.is_running());
}
