use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capture_override::Core::{
    ClientId, ClientKind, EngineError, MetadataPool, MetadataStore, OutputMetadataPool,
    TagBuffer, TagId, MAX_SHARED_BUFFERS,
};
use serial_test::serial;

fn exclusive(pool: &MetadataPool, buffers: usize) -> ClientId {
    pool.register_client(ClientKind::Exclusive, &[1, 2], &[1], buffers)
        .expect("register")
}

#[test]
#[serial]
fn test_get_returns_empty_referenced_buffer() {
    let pool = MetadataPool::new(true);
    let client = exclusive(&pool, 2);
    assert_eq!(pool.buffer_count(client).unwrap(), 2);
    assert_eq!(pool.free_count(client).unwrap(), 2);

    let handle = pool.get(client, 17).expect("get");
    assert_eq!(pool.reference_count(&handle).unwrap(), 1);
    assert_eq!(pool.frame_number(&handle).unwrap(), 17);
    assert_eq!(pool.with_buffer(&handle, |store| store.count()).unwrap(), 0);
    assert_eq!(pool.free_count(client).unwrap(), 1);

    println!("Pool Struct: {:#?}", pool);
    println!("Handle: {:?}", handle);
}

#[test]
#[serial]
fn test_release_invalidates_then_frees() {
    let pool = MetadataPool::new(true);
    let client = exclusive(&pool, 1);
    let handle = pool.get(client, 1).expect("get");
    pool.with_buffer_mut(&handle, |store| store.set(1, b"on"))
        .expect("valid")
        .expect("set");

    assert_eq!(pool.add_reference(&handle).unwrap(), 2);
    pool.release(&handle).expect("first release");
    assert!(pool.is_live(&handle), "one reference left");
    assert!(matches!(
        pool.with_buffer(&handle, |store| store.count()),
        Err(EngineError::InvalidMetadata { .. })
    ));

    pool.release(&handle).expect("second release");
    assert!(!pool.is_live(&handle));
    assert!(matches!(
        pool.release(&handle),
        Err(EngineError::StaleHandle { .. })
    ));
    assert_eq!(pool.free_count(client).unwrap(), 1);
}

#[test]
#[serial]
fn test_full_client_evicts_oldest() {
    let pool = MetadataPool::new(true);
    let client = exclusive(&pool, 2);

    let first = pool.get(client, 1).expect("get");
    thread::sleep(Duration::from_millis(2));
    let second = pool.get(client, 2).expect("get");
    thread::sleep(Duration::from_millis(2));
    let third = pool.get(client, 3).expect("eviction makes room");

    assert_eq!(third.index(), first.index(), "oldest buffer is the victim");
    assert!(!pool.is_live(&first));
    assert!(matches!(
        pool.release(&first),
        Err(EngineError::StaleHandle { .. })
    ));
    assert_eq!(pool.reference_count(&third).unwrap(), 1);
    assert_eq!(pool.reference_count(&second).unwrap(), 1);
    assert_eq!(pool.buffer_count(client).unwrap(), 2, "eviction never grows the client");
}

#[test]
#[serial]
fn test_full_client_without_reuse_is_exhausted() {
    let pool = MetadataPool::new(false);
    let client = exclusive(&pool, 2);
    let _a = pool.get(client, 1).expect("get");
    let _b = pool.get(client, 2).expect("get");

    match pool.get(client, 3) {
        Err(EngineError::PoolExhausted { client: raw, capacity }) => {
            assert_eq!(raw, client.raw());
            assert_eq!(capacity, 2);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_unreferenced_buffer_is_reclaimed() {
    let pool = MetadataPool::new(false);
    let client = exclusive(&pool, 1);
    let first = pool.get(client, 1).expect("get");

    // Reference dropped on the store itself, never returned through the pool
    let remaining = pool
        .with_buffer_mut(&first, |store| store.release_reference())
        .expect("valid");
    assert_eq!(remaining, 0);
    assert_eq!(pool.free_count(client).unwrap(), 0);

    let second = pool.get(client, 2).expect("zero-ref buffer is reclaimed");
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert!(!pool.is_live(&first));
    assert_eq!(pool.reference_count(&second).unwrap(), 1);
    assert_eq!(pool.buffer_count(client).unwrap(), 1);
}

#[test]
#[serial]
fn test_shared_client_grows_on_demand() {
    let pool = MetadataPool::new(false);
    let client = pool
        .register_client(ClientKind::Shared, &[1], &[], 2)
        .expect("register");
    assert_eq!(pool.buffer_count(client).unwrap(), 2);
    assert_eq!(pool.capacity(client).unwrap(), MAX_SHARED_BUFFERS);

    let _a = pool.get(client, 1).expect("get");
    let _b = pool.get(client, 2).expect("get");
    let c = pool.get(client, 3).expect("spare capacity allocates a new buffer");
    assert_eq!(c.index(), 2);
    assert_eq!(pool.buffer_count(client).unwrap(), 3);
    assert_eq!(pool.free_count(client).unwrap(), 0);
    assert_eq!(pool.reference_count(&c).unwrap(), 1);

    pool.release(&c).expect("release");
    let again = pool.get(client, 4).expect("get");
    assert_eq!(again.index(), 2, "grown buffer is reused before growing again");
    assert_eq!(pool.buffer_count(client).unwrap(), 3);
}

#[test]
#[serial]
fn test_reused_entry_drops_shared_capacity() {
    let pool = MetadataPool::new(false);
    let shared = pool
        .register_client(ClientKind::Shared, &[1], &[], 1)
        .expect("register");
    pool.unregister_client(shared).expect("unregister");

    let client = exclusive(&pool, 1);
    assert_eq!(client.index(), shared.index());
    assert_eq!(pool.capacity(client).unwrap(), 1);
    let _a = pool.get(client, 1).expect("get");
    assert!(matches!(
        pool.get(client, 2),
        Err(EngineError::PoolExhausted { capacity: 1, .. })
    ));
}

#[test]
#[serial]
fn test_shared_clients_share_one_entry() {
    let pool = MetadataPool::new(true);
    let a = pool
        .register_client(ClientKind::Shared, &[1], &[], 2)
        .expect("register");
    let b = pool
        .register_client(ClientKind::Shared, &[2, 3], &[3], 4)
        .expect("register");

    assert_eq!(a.index(), b.index());
    assert_eq!(a.sub(), 0);
    assert_eq!(b.sub(), 1);
    assert_eq!(pool.buffer_count(a).unwrap(), 4);
    assert_eq!(pool.tags(b).unwrap(), vec![1, 2, 3]);
    assert_eq!(pool.partial_tags(a).unwrap(), vec![3]);
    assert_eq!(pool.kind(a).unwrap(), ClientKind::Shared);

    pool.unregister_client(a).expect("unregister");
    assert!(matches!(pool.get(a, 1), Err(EngineError::InvalidClient(_))));
    let handle = pool.get(b, 1).expect("other sub-client still works");
    pool.release(&handle).expect("release");

    let exclusive_id = exclusive(&pool, 1);
    assert_ne!(exclusive_id.index(), b.index());
    assert_eq!(pool.client_count(), 3, "reserved entry plus two clients");
}

#[test]
#[serial]
fn test_unregistered_entry_is_reused() {
    let pool = MetadataPool::new(true);
    let first = exclusive(&pool, 1);
    pool.unregister_client(first).expect("unregister");
    assert!(matches!(
        pool.unregister_client(first),
        Err(EngineError::InvalidClient(_))
    ));

    let second = exclusive(&pool, 1);
    assert_eq!(second.index(), first.index());
}

#[test]
#[serial]
fn test_invalid_client_ids() {
    let pool = MetadataPool::default();
    assert!(pool.reuse_enabled());
    assert!(matches!(
        pool.get(ClientId::from_raw(0), 1),
        Err(EngineError::InvalidClient(0))
    ));
    assert!(matches!(
        pool.get(ClientId::pack(5, 0), 1),
        Err(EngineError::InvalidClient(_))
    ));
    assert!(matches!(
        pool.register_client(ClientKind::Exclusive, &[], &[], 0),
        Err(EngineError::InvalidConfig { .. })
    ));

    let id = ClientId::pack(3, 2);
    assert_eq!(id.index(), 3);
    assert_eq!(id.sub(), 2);
    assert_eq!(id.raw(), 0x0002_0003);
}

#[test]
#[serial]
fn test_pool_flush_releases_everything() {
    let pool = MetadataPool::new(true);
    let client = exclusive(&pool, 3);
    let handles: Vec<_> = (0..3).map(|f| pool.get(client, f).expect("get")).collect();

    pool.flush();
    for handle in &handles {
        assert!(!pool.is_live(handle));
    }
    assert_eq!(pool.free_count(client).unwrap(), 3);
    assert!(pool.track_stale(Duration::ZERO).is_empty());
}

#[test]
#[serial]
fn test_track_stale_and_print() {
    let pool = MetadataPool::new(true);
    let client = exclusive(&pool, 2);
    let held = pool.get(client, 42).expect("get");

    let stale = pool.track_stale(Duration::ZERO);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].frame_number, 42);
    assert_eq!(stale[0].references, 1);
    assert!(pool.track_stale(Duration::from_secs(3600)).is_empty());

    pool.set_pipeline_id(client, 9).expect("pipeline id");
    assert_eq!(pool.pipeline_id(), Some(9));
    assert_eq!(pool.sub_pipeline_id(client).unwrap(), 9);

    let listing = pool.print_all_buffers(client).expect("listing");
    assert!(listing.contains("frame=42"));
    assert_eq!(listing.lines().count(), 3);
    pool.release(&held).expect("release");
}

#[test]
#[serial]
fn test_custom_store_factory() {
    let created = Arc::new(parking_lot::Mutex::new(Vec::<Vec<TagId>>::new()));
    let seen = created.clone();
    let pool = MetadataPool::with_factory(
        true,
        Arc::new(move |tags: &[TagId]| {
            seen.lock().push(tags.to_vec());
            Box::new(TagBuffer::new()) as Box<dyn MetadataStore>
        }),
    );
    let _client = pool
        .register_client(ClientKind::Exclusive, &[4, 5], &[], 2)
        .expect("register");
    assert_eq!(*created.lock(), vec![vec![4, 5], vec![4, 5]]);
}

#[test]
#[serial]
fn test_concurrent_rentals_on_separate_clients() {
    let pool = Arc::new(MetadataPool::new(true));
    let clients: Vec<ClientId> = (0..4).map(|_| exclusive(&pool, 4)).collect();

    let workers: Vec<_> = clients
        .into_iter()
        .map(|client| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for frame in 0..200u64 {
                    let handle = pool.get(client, frame).expect("get");
                    let value = fastrand::u32(..).to_le_bytes();
                    pool.with_buffer_mut(&handle, |store| store.set(1, &value))
                        .expect("valid")
                        .expect("set");
                    pool.release(&handle).expect("release");
                }
                pool.free_count(client).expect("client")
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().expect("worker"), 4);
    }
}

#[test]
#[serial]
fn test_output_pool_lends_and_recycles() {
    let pool = OutputMetadataPool::new(1);

    let mut full = pool.acquire(false);
    assert!(full.is_pooled());
    assert!(!full.is_sparse());
    full.set(1, b"x").expect("set");
    assert_eq!(pool.outstanding(), 1);

    let overflow = pool.acquire(false);
    assert!(!overflow.is_pooled(), "exhausted pool hands out a transient buffer");
    assert_eq!(pool.transient_count(), 1);
    drop(overflow);

    drop(full);
    assert_eq!(pool.outstanding(), 0);
    let again = pool.acquire(false);
    assert!(again.is_pooled());
    assert_eq!(again.count(), 0, "returned buffers are reset");

    let sparse = pool.acquire(true);
    assert!(sparse.is_sparse());
    assert!(!sparse.is_pooled(), "full-size buffers are not lent as sparse ones");
    assert_eq!(pool.allocated(), 1);
    println!("Output metadata: {:?}", again);
}
