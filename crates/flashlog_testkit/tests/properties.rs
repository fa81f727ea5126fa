//! Property tests for the session log and the delivery path.

use flashlog_core::{BufferMode, CoreError, EngineConfig, ItemType, SessionId};
use flashlog_storage::{FileStore, InMemoryStore};
use flashlog_sync::SyncConfig;
use flashlog_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

/// Applies `ops` to a session and to a byte-vector model of its unread
/// data. Returns the model.
fn run_script(fixture: &EngineFixture, id: SessionId, item: ItemType, ops: &[LogOp]) -> Vec<u8> {
    let size = usize::from(item.size);
    let mut model = Vec::new();
    for op in ops {
        match op {
            LogOp::Write(data) => {
                fixture.engine.write(id, data).unwrap();
                model.extend_from_slice(data);
            }
            LogOp::Consume(items) => {
                let n = (items * size).min(model.len());
                fixture.engine.consume(id, n).unwrap();
                model.drain(..n);
            }
            LogOp::Resync => fixture.engine.consume(id, 0).unwrap(),
        }
    }
    model
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn log_matches_model((item, ops) in session_script_strategy(30)) {
        let fixture = EngineFixture::memory(EngineConfig::default());
        let id = fixture.add_session(1, item);
        let model = run_script(&fixture, id, item, &ops);

        prop_assert_eq!(fixture.engine.num_bytes(id) as usize, model.len());
        prop_assert_eq!(fixture.read_all(id), model);
    }

    #[test]
    fn resync_is_idempotent((item, ops) in session_script_strategy(20)) {
        let fixture = EngineFixture::memory(EngineConfig::default());
        let id = fixture.add_session(1, item);
        run_script(&fixture, id, item, &ops);
        let unread = fixture.engine.num_bytes(id);
        let data = fixture.read_all(id);

        fixture.engine.consume(id, 0).unwrap();
        fixture.engine.consume(id, 0).unwrap();
        prop_assert_eq!(fixture.engine.num_bytes(id), unread);
        prop_assert_eq!(fixture.read_all(id), data);
    }

    #[test]
    fn rebuild_never_loses_unread_data((item, ops) in session_script_strategy(30)) {
        let fixture = EngineFixture::memory(EngineConfig::default());
        let id = fixture.add_session(1, item);
        let model = run_script(&fixture, id, item, &ops);

        let (rebooted, _) = fixture.reboot().unwrap();
        let recovered = rebooted.read_all(id);
        prop_assert!(recovered.ends_with(&model));
        prop_assert_eq!(recovered.len() % usize::from(item.size), 0);

        let (again, _) = rebooted.reboot().unwrap();
        prop_assert_eq!(again.read_all(id), recovered);
    }

    #[test]
    fn quota_holds_after_every_write(
        scripts in prop::collection::vec(session_script_strategy(15), 1..=4)
    ) {
        let config = EngineConfig::new()
            .quota_bytes(2048)
            .initial_file_size(256)
            .free_band(16, 128);
        let fixture = EngineFixture::memory(config);
        let sessions: Vec<_> = scripts
            .iter()
            .enumerate()
            .map(|(i, (item, _))| fixture.add_session(i as u8 + 1, *item))
            .collect();

        for ((item, ops), id) in scripts.iter().zip(&sessions) {
            let size = usize::from(item.size);
            for op in ops {
                match op {
                    LogOp::Write(data) => match fixture.engine.write(*id, data) {
                        Ok(()) | Err(CoreError::ResourceExhausted { .. }) => {}
                        Err(err) => panic!("unexpected write error: {err}"),
                    },
                    LogOp::Consume(items) => {
                        let unread = fixture.engine.num_bytes(*id) as usize;
                        let n = (items * size).min(unread);
                        fixture.engine.consume(*id, n - n % size).unwrap();
                    }
                    LogOp::Resync => fixture.engine.consume(*id, 0).unwrap(),
                }
                prop_assert!(fixture.engine.quota_used().unwrap() <= 2048);
            }
        }
    }

    #[test]
    fn host_receives_exactly_what_was_logged(
        sessions in prop::collection::vec(
            item_type_strategy().prop_flat_map(|item| {
                let max = (400 / usize::from(item.size)).max(1);
                (Just(item), prop::collection::vec(records_strategy(item, max), 1..=5))
            }),
            1..=3,
        )
    ) {
        let harness = ServiceHarness::new(Arc::new(InMemoryStore::new()), SyncConfig::new());
        let mut host = HostSimulator::new(HostPolicy::AckAll);

        let mut logged = Vec::new();
        for (tag, (item, records)) in sessions.iter().enumerate() {
            let handle = harness
                .service
                .create_for_current_owner(tag as u32, *item, BufferMode::Unbuffered)
                .unwrap();
            for record in records {
                harness.service.log(handle, record).unwrap();
                host.pump(&harness);
            }
            logged.push((handle, records.concat()));
        }
        for (handle, _) in &logged {
            harness.service.finish(*handle).unwrap();
        }
        host.pump(&harness);

        for (handle, data) in &logged {
            prop_assert_eq!(host.received(handle.id.as_u8()), data.as_slice());
        }
        prop_assert!(harness.service.registry().is_empty());
        prop_assert!(host.open_sessions().is_empty());
    }
}

#[test]
fn failed_write_is_contained_to_its_session() {
    let store = FaultyStore::new(InMemoryStore::new());
    let fixture = EngineFixture::new(
        Arc::new(store.clone()) as Arc<dyn FileStore>,
        EngineConfig::default(),
    );
    let a = fixture.add_session(1, ItemType::unsigned(1));
    let b = fixture.add_session(2, ItemType::unsigned(1));
    fixture.engine.write(a, &[1, 2]).unwrap();
    fixture.engine.write(b, &[3, 4]).unwrap();

    store.fail_next(FaultPoint::Write);
    let _ = fixture.engine.write(a, &[5]);
    assert_eq!(store.injected(), 1);
    assert_eq!(fixture.engine.num_bytes(a), 0);

    fixture.engine.write(b, &[6]).unwrap();
    assert_eq!(fixture.read_all(b), vec![3, 4, 6]);
}

#[test]
fn nacked_data_is_resent_on_the_next_sweep() {
    let harness = ServiceHarness::new(Arc::new(InMemoryStore::new()), SyncConfig::new());
    let mut host = HostSimulator::new(HostPolicy::NackFirst(1));
    let handle = harness
        .service
        .create_for_current_owner(9, ItemType::unsigned(2), BufferMode::Unbuffered)
        .unwrap();
    harness.service.log(handle, &[1, 0, 2, 0]).unwrap();
    harness.service.finish(handle).unwrap();
    host.pump(&harness);
    assert!(host.received(handle.id.as_u8()).is_empty());

    harness.service.send_all(true);
    host.pump(&harness);
    assert_eq!(host.received(handle.id.as_u8()), &[1, 0, 2, 0]);
    assert!(harness.service.registry().is_empty());
}
