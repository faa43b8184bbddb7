//! Integration test covering successive backend responses flowing through the
//! repository and out to product receivers.

mod common;

use std::sync::{Arc, Mutex};

use common::fixtures::{ResponseBuilder, TargetFixture, BLOCKING_PATH, DATA_PATH, RULES_PATH};
use remote_config_core::{
    apply_config_response, ApplyState, Change, ConfigPath, Dispatcher, ProductMatcher, Receiver,
    Repository, SyncError,
};

type Seen = Arc<Mutex<Vec<(String, &'static str)>>>;

fn recording_dispatcher(products: &[&str]) -> (Dispatcher, Seen) {
    let seen: Seen = Arc::default();
    let mut dispatcher = Dispatcher::new();
    let sink = seen.clone();
    dispatcher.register(Receiver::new(
        ProductMatcher::products(products.iter().copied()),
        move |snapshot, changes| {
            let mut sink = sink.lock().unwrap();
            for change in changes {
                let kind = match change {
                    Change::Inserted { .. } => "inserted",
                    Change::Updated { .. } => "updated",
                    Change::Deleted { .. } => "deleted",
                };
                if let Some(content) = change.content() {
                    assert!(snapshot.get(change.path()).is_some());
                    content.applied();
                }
                sink.push((change.path().to_string(), kind));
            }
        },
    ));
    (dispatcher, seen)
}

/// Walks a client through insert, no-op, update and delete cycles.
#[test]
fn successive_responses_produce_expected_changes() {
    let repository = Repository::new();
    let (dispatcher, seen) = recording_dispatcher(&["ASM", "ASM_DD", "ASM_DATA"]);

    let first = ResponseBuilder::new(10)
        .target(TargetFixture::new(BLOCKING_PATH, r#"{"actions":[]}"#, 1))
        .target(TargetFixture::new(RULES_PATH, r#"{"version":"2.2","rules":[]}"#, 1))
        .build();
    let changes = apply_config_response(&repository, first).unwrap();
    dispatcher.dispatch(&changes, &repository.snapshot());

    let state = repository.state();
    assert_eq!(state.targets_version, 10);
    assert_eq!(state.opaque_backend_state.as_deref(), Some("opaque-10"));
    assert_eq!(state.config_states.len(), 2);
    assert!(state
        .config_states
        .iter()
        .all(|config| config.apply_state == ApplyState::Acknowledged));
    assert_eq!(state.cached_target_files.len(), 2);

    // Same files, payloads omitted: nothing changes but metadata moves forward.
    let unchanged = ResponseBuilder::new(11)
        .target(TargetFixture::new(BLOCKING_PATH, r#"{"actions":[]}"#, 1).cached())
        .target(TargetFixture::new(RULES_PATH, r#"{"version":"2.2","rules":[]}"#, 1).cached())
        .build();
    let changes = apply_config_response(&repository, unchanged).unwrap();
    assert!(changes.is_empty());
    assert_eq!(repository.snapshot().targets_version(), 11);

    let third = ResponseBuilder::new(12)
        .target(TargetFixture::new(BLOCKING_PATH, r#"{"actions":[1]}"#, 2))
        .target(TargetFixture::new(DATA_PATH, r#"{"rules_data":[]}"#, 1))
        .build();
    let changes = apply_config_response(&repository, third).unwrap();
    dispatcher.dispatch(&changes, &repository.snapshot());

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (BLOCKING_PATH.to_string(), "inserted"),
            (RULES_PATH.to_string(), "inserted"),
            (RULES_PATH.to_string(), "deleted"),
            (BLOCKING_PATH.to_string(), "updated"),
            (DATA_PATH.to_string(), "inserted"),
        ]
    );

    let snapshot = repository.snapshot();
    let blocking = ConfigPath::parse(BLOCKING_PATH).unwrap();
    assert_eq!(snapshot.get(&blocking).unwrap().version(), 2);
    assert!(snapshot
        .get(&ConfigPath::parse(RULES_PATH).unwrap())
        .is_none());
}

/// A response missing a payload for a new path is rejected wholesale.
#[test]
fn missing_payload_rejects_response() {
    let repository = Repository::new();
    let response = ResponseBuilder::new(3)
        .target(TargetFixture::new(BLOCKING_PATH, "{}", 1))
        .target(TargetFixture::new(RULES_PATH, "{}", 1).cached())
        .build();

    let err = apply_config_response(&repository, response).unwrap_err();
    assert!(matches!(err, SyncError::MissingContent(_)));
    assert!(repository.snapshot().contents().is_empty());

    let state = repository.state();
    assert!(state.has_error);
    let serialized = serde_json::to_value(&state).unwrap();
    assert_eq!(serialized["has_error"], true);
    assert_eq!(serialized["root_version"], 1);
    assert!(serialized.get("backend_client_state").is_some());
}

/// Readers holding an old snapshot keep seeing it after a commit.
#[test]
fn snapshots_are_isolated_from_later_commits() {
    let repository = Repository::new();
    let before = repository.snapshot();

    let response = ResponseBuilder::new(1)
        .target(TargetFixture::new(BLOCKING_PATH, "{}", 1))
        .build();
    apply_config_response(&repository, response).unwrap();

    assert!(before.contents().is_empty());
    assert_eq!(before.targets_version(), 0);
    assert_eq!(repository.snapshot().contents().len(), 1);
}
