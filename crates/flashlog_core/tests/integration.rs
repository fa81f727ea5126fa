//! Integration tests for the storage engine and session registry.

use flashlog_core::storage::format::file_name;
use flashlog_core::{
    scan_log, BufferMode, CoreError, CreateParams, EngineConfig, EngineStats, ItemType,
    LogOutcome, OwnerTask, SessionId, SessionMeta, SessionRegistry, SessionStatus, StorageEngine,
};
use flashlog_storage::{DirectoryStore, FileStore, FlashFile, InMemoryStore};
use rand::rngs::mock::StepRng;
use std::sync::Arc;
use uuid::Uuid;

fn engine_over(store: Arc<dyn FileStore>, config: EngineConfig) -> Arc<StorageEngine> {
    Arc::new(StorageEngine::new(store, config, Arc::new(EngineStats::new())))
}

fn params(tag: u32, item: ItemType, buffer: BufferMode) -> CreateParams {
    CreateParams {
        tag,
        owner: Uuid::from_u128(0x5EED),
        task: OwnerTask::App,
        item,
        buffer,
    }
}

fn u32_items(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read(engine: &StorageEngine, id: SessionId, max: usize) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    let outcome = engine.read(id, Some(&mut buf), max).unwrap();
    buf.truncate(outcome.len);
    buf
}

#[test]
fn buffered_u32_round_trip() {
    let engine = engine_over(Arc::new(InMemoryStore::new()), EngineConfig::default());
    let registry = SessionRegistry::with_rng(Arc::clone(&engine), StepRng::new(1, 1));
    let meta = registry
        .create(
            params(1, ItemType::unsigned(4), BufferMode::Provided(vec![0; 64])),
            1_000,
        )
        .unwrap();
    let handle = meta.handle();

    registry.log(handle, &u32_items(&[1, 2, 3])).unwrap();
    registry.log(handle, &u32_items(&[4, 5])).unwrap();
    registry.flush(handle);

    assert_eq!(read(&engine, meta.id, 20), u32_items(&[1, 2, 3, 4, 5]));
    engine.consume(meta.id, 20).unwrap();
    assert_eq!(engine.read(meta.id, None, 20).unwrap().len, 0);
    assert_eq!(engine.num_bytes(meta.id), 0);
}

#[test]
fn three_byte_integers_are_rejected() {
    let engine = engine_over(Arc::new(InMemoryStore::new()), EngineConfig::default());
    let registry = SessionRegistry::new(engine);
    for buffer in [BufferMode::Unbuffered, BufferMode::Provided(vec![0; 64])] {
        let err = registry
            .create(params(1, ItemType::signed(3), buffer), 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }
    assert!(registry.is_empty());
}

#[test]
fn oversized_log_leaves_buffer_untouched() {
    let engine = engine_over(Arc::new(InMemoryStore::new()), EngineConfig::default());
    let registry = SessionRegistry::new(Arc::clone(&engine));
    let meta = registry
        .create(
            params(1, ItemType::byte_array(300), BufferMode::Provided(vec![0; 300])),
            0,
        )
        .unwrap();
    let handle = meta.handle();
    registry.log(handle, &[0xAB; 300]).unwrap();

    let err = registry.log(handle, &[0xCD; 600]).unwrap_err();
    assert!(err.is_validation());

    let session = registry.get(handle).unwrap();
    assert_eq!(session.staged_bytes(), 300);
    registry.flush(handle);
    assert_eq!(read(&engine, meta.id, 1024), vec![0xAB; 300]);
}

#[test]
fn reads_stop_at_item_boundaries() {
    let engine = engine_over(Arc::new(InMemoryStore::new()), EngineConfig::default());
    let registry = SessionRegistry::new(Arc::clone(&engine));
    let meta = registry
        .create(params(1, ItemType::byte_array(30), BufferMode::Unbuffered), 0)
        .unwrap();
    let data: Vec<u8> = (0..240u32).map(|i| i as u8).collect();
    registry.log(meta.handle(), &data).unwrap();

    let first = read(&engine, meta.id, 100);
    assert_eq!(first, data[..90]);
    engine.consume(meta.id, first.len()).unwrap();

    let rest = read(&engine, meta.id, 1024);
    assert_eq!(rest, data[90..]);
}

#[test]
fn quota_holds_across_many_sessions() {
    let config = EngineConfig::new()
        .quota_bytes(2048)
        .initial_file_size(256)
        .free_band(16, 128)
        .max_sessions(8);
    let store = InMemoryStore::new();
    let engine = engine_over(Arc::new(store.clone()), config);
    let registry = SessionRegistry::with_rng(Arc::clone(&engine), StepRng::new(10, 1));

    let sessions: Vec<SessionMeta> = (0..8)
        .map(|tag| {
            registry
                .create(params(tag, ItemType::unsigned(1), BufferMode::Unbuffered), tag)
                .unwrap()
        })
        .collect();

    for round in 0..40u8 {
        for meta in &sessions {
            match registry.log(meta.handle(), &[round; 37]) {
                Ok(_) | Err(CoreError::ResourceExhausted { .. }) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
            assert!(engine.quota_used().unwrap() <= 2048);
        }
        if round % 3 == 0 {
            for meta in &sessions {
                let n = engine.read(meta.id, None, 64).unwrap().len;
                engine.consume(meta.id, n).unwrap();
            }
        }
    }
    assert_eq!(store.total_size(), engine.quota_used().unwrap());
    assert!(engine.stats().snapshot().compactions > 0);
}

#[test]
fn finished_session_is_deleted_after_delivery() {
    let store = InMemoryStore::new();
    let engine = engine_over(Arc::new(store.clone()), EngineConfig::default());
    let registry = SessionRegistry::new(Arc::clone(&engine));
    let meta = registry
        .create(params(1, ItemType::unsigned(2), BufferMode::Provided(vec![0; 32])), 0)
        .unwrap();
    registry.log(meta.handle(), &[1, 2, 3, 4]).unwrap();
    registry.finish(meta.handle()).unwrap();

    assert_eq!(registry.status(meta.id), Some(SessionStatus::Inactive));
    assert_eq!(store.file_count(), 1);
    engine.consume(meta.id, 4).unwrap();
    assert!(registry.delete_if_drained(meta.id));
    assert_eq!(store.file_count(), 0);
}

#[test]
fn concurrent_sessions_keep_their_own_data() {
    let engine = engine_over(Arc::new(InMemoryStore::new()), EngineConfig::default());
    let registry = Arc::new(SessionRegistry::with_rng(
        Arc::clone(&engine),
        StepRng::new(1, 1),
    ));
    let metas: Vec<SessionMeta> = (0..4u32)
        .map(|tag| {
            let buffer = if tag % 2 == 0 {
                BufferMode::Unbuffered
            } else {
                BufferMode::Provided(vec![0; 32])
            };
            registry
                .create(params(tag, ItemType::unsigned(1), buffer), 0)
                .unwrap()
        })
        .collect();

    let threads: Vec<_> = metas
        .iter()
        .map(|meta| {
            let registry = Arc::clone(&registry);
            let handle = meta.handle();
            let byte = meta.tag as u8;
            std::thread::spawn(move || {
                for _ in 0..100 {
                    loop {
                        match registry.log(handle, &[byte]) {
                            Ok(LogOutcome::Buffered {
                                schedule_flush: true,
                            }) => {
                                registry.flush(handle);
                                break;
                            }
                            Ok(_) => break,
                            Err(err) if err.is_retryable() => {
                                registry.flush(handle);
                            }
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                    }
                }
                registry.finish(handle).unwrap();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    for meta in &metas {
        assert_eq!(read(&engine, meta.id, 1024), vec![meta.tag as u8; 100]);
    }
}

#[test]
fn rebuild_from_directory_matches_forward_scan() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new().initial_file_size(128).free_band(16, 64);
    let ids;
    {
        let store = DirectoryStore::open(dir.path(), true).unwrap();
        let engine = engine_over(Arc::new(store), config.clone());
        let registry = SessionRegistry::with_rng(Arc::clone(&engine), StepRng::new(3, 4));
        let a = registry
            .create(params(1, ItemType::unsigned(2), BufferMode::Unbuffered), 11)
            .unwrap();
        let b = registry
            .create(params(2, ItemType::byte_array(10), BufferMode::Unbuffered), 12)
            .unwrap();
        let c = registry
            .create(params(3, ItemType::unsigned(1), BufferMode::Unbuffered), 13)
            .unwrap();
        for i in 0..20u8 {
            registry.log(a.handle(), &[i, 0]).unwrap();
        }
        registry.log(b.handle(), &[7u8; 250]).unwrap();
        registry.log(c.handle(), &[1, 2, 3]).unwrap();
        engine.consume(a.id, 10).unwrap();
        engine.consume(b.id, 100).unwrap();
        engine.consume(c.id, 3).unwrap();
        ids = (a.id, b.id, c.id);
    }

    let store = Arc::new(DirectoryStore::open(dir.path(), false).unwrap());
    let engine = engine_over(Arc::clone(&store) as Arc<dyn FileStore>, config);
    let restored = engine.rebuild().unwrap();
    let restored_ids: Vec<SessionId> = restored.iter().map(|h| h.session_id).collect();
    assert_eq!(restored_ids, vec![ids.0, ids.1]);
    assert!(store.open(&file_name(ids.2)).is_err());

    let registry = SessionRegistry::new(Arc::clone(&engine));
    for header in &restored {
        let meta = registry.restore(header);
        assert_eq!(registry.status(meta.id), Some(SessionStatus::Inactive));

        let file = store.open(&file_name(meta.id)).unwrap();
        let scan = scan_log(file.as_ref()).unwrap();
        let cursor = engine.cursor(meta.id).unwrap();
        assert_eq!(cursor.write_offset, scan.write_offset);
        assert_eq!(
            u64::from(cursor.num_bytes) + u64::from(cursor.read_skip),
            live_after(&*file, cursor.read_offset)
        );
    }

    assert_eq!(engine.num_bytes(ids.0), 30);
    assert_eq!(engine.num_bytes(ids.1), 150);
    assert_eq!(read(&engine, ids.1, 1024), vec![7u8; 150]);
}

/// Live payload from `offset` to the end of the chunk sequence.
fn live_after(file: &dyn FlashFile, offset: u64) -> u64 {
    let mut pos = offset;
    let mut live = 0;
    loop {
        if pos >= file.size() {
            return live;
        }
        let header = file.read_vec(pos, 1).unwrap()[0];
        if header == 0xFF {
            return live;
        }
        let len = u64::from(header & 0x7F);
        if header & 0x80 != 0 {
            live += len;
        }
        pos += 1 + len;
    }
}

#[test]
fn unbuffered_write_beyond_quota_is_exhausted() {
    let config = EngineConfig::new().quota_bytes(128).initial_file_size(64);
    let engine = engine_over(Arc::new(InMemoryStore::new()), config);
    let registry = SessionRegistry::new(engine);
    let meta = registry
        .create(params(1, ItemType::byte_array(200), BufferMode::Unbuffered), 0)
        .unwrap();
    let err = registry.log(meta.handle(), &[0u8; 200]).unwrap_err();
    assert!(matches!(err, CoreError::ResourceExhausted { .. }));
}
