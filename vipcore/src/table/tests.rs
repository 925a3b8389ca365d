use super::*;
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

assert_impl_all!(HandleTable<u64>: Send, Sync);

#[test]
fn test_new_rejects_zero_capacity() {
    assert!(matches!(
        HandleTable::<u32>::new("zero", 0),
        Err(VipError::InvalidArguments(_))
    ));
}

#[test]
fn test_insert_use_and_len() -> Result<()> {
    let table = HandleTable::new("db", 4)?;

    for i in 0..4u32 {
        let index = table.insert(i * 10)?;
        assert_eq!(*table.use_index(index)?, i * 10);
        assert_eq!(table.len(), i as usize + 1);
    }

    Ok(())
}

#[test]
fn test_full_table_is_out_of_resource() -> Result<()> {
    let table = HandleTable::new("db", 2)?;
    table.insert(1)?;
    table.insert(2)?;

    let err = table.insert(3).unwrap_err();
    assert!(err.is_retryable());

    // Caller expands and retries.
    assert_eq!(table.expand()?, 4);
    assert!(table.insert(3).is_ok());
    Ok(())
}

#[test]
fn test_handle_lookup_and_duplicates() -> Result<()> {
    let table = HandleTable::new("hashmap", 4)?;

    let index = table.insert_handle(0xdead_beef, "tcb")?;
    assert_eq!(table.index_of(0xdead_beef)?, index);
    assert_eq!(*table.use_handle(0xdead_beef)?, "tcb");

    assert!(matches!(
        table.insert_handle(0xdead_beef, "dup"),
        Err(VipError::InvalidArguments(_))
    ));
    assert!(table.use_handle(0x1234).is_err());
    Ok(())
}

#[test]
fn test_ref_count_tracks_use_and_release() -> Result<()> {
    let table = HandleTable::new("db", 2)?;
    let index = table.insert(7)?;

    let a = table.use_index(index)?;
    let b = table.use_index(index)?;
    assert_eq!(table.ref_count(index), Some(2));

    drop(a);
    assert_eq!(table.ref_count(index), Some(1));

    b.release(false);
    assert_eq!(table.ref_count(index), Some(0));
    Ok(())
}

#[test]
fn test_removal_deferred_until_last_release() -> Result<()> {
    let freed = Arc::new(AtomicUsize::new(0));
    let table = {
        let freed = Arc::clone(&freed);
        HandleTable::new("db", 1)?.with_free_callback(move |_, _: &u32| {
            freed.fetch_add(1, Ordering::Relaxed);
        })
    };

    let index = table.insert(42)?;
    let held = table.use_index(index)?;

    assert!(!table.remove_index(index, false)?);
    assert_eq!(freed.load(Ordering::Relaxed), 0);

    // Marked for removal: no new users, no reuse, handle lookups fail.
    assert!(table.use_index(index).is_err());
    assert!(table.index_of(index as Handle).is_err());
    assert!(table.insert(43).is_err());
    assert_eq!(*held, 42);

    drop(held);
    assert_eq!(freed.load(Ordering::Relaxed), 1);
    assert_eq!(table.len(), 0);
    assert_eq!(table.insert(43)?, index);
    Ok(())
}

#[test]
fn test_release_without_callback() -> Result<()> {
    let freed = Arc::new(AtomicUsize::new(0));
    let table = {
        let freed = Arc::clone(&freed);
        HandleTable::new("db", 1)?.with_free_callback(move |_, _: &u32| {
            freed.fetch_add(1, Ordering::Relaxed);
        })
    };

    let index = table.insert(1)?;
    let held = table.use_index(index)?;
    table.remove_index(index, false)?;

    held.release(false);
    assert_eq!(freed.load(Ordering::Relaxed), 0);
    assert_eq!(table.len(), 0);
    Ok(())
}

#[test]
fn test_forced_removal_invalidates_outstanding_refs() -> Result<()> {
    let table = HandleTable::new("db", 1)?;
    let index = table.insert(String::from("old"))?;
    let stale = table.use_index(index)?;

    assert!(table.remove_index(index, true)?);
    assert_eq!(table.insert(String::from("new"))?, index);

    // Releasing the stale reference must not touch the new occupant.
    let fresh = table.use_index(index)?;
    drop(stale);
    assert_eq!(table.ref_count(index), Some(1));
    assert_eq!(*fresh, "new");
    Ok(())
}

#[test]
fn test_expansion_preserves_indices_and_contents() -> Result<()> {
    let capacity = 8;
    let table = HandleTable::new("descriptors", capacity)?;

    let indices = (0..capacity)
        .map(|i| table.insert(format!("desc-{}", i)))
        .collect::<Result<Vec<_>, _>>()?;

    // One more than capacity triggers exactly one expansion.
    let extra = table.insert_or_expand(None, String::from("desc-extra"))?;
    assert_eq!(table.expansions(), 1);
    assert_eq!(table.capacity(), capacity * 2);

    for (i, index) in indices.iter().enumerate() {
        assert_eq!(*table.use_index(*index)?, format!("desc-{}", i));
    }
    assert_eq!(*table.use_index(extra)?, "desc-extra");
    Ok(())
}

#[test]
fn test_snapshot_only_lists_live_entries() -> Result<()> {
    let table = HandleTable::new("hashmap", 4)?;
    let a = table.insert_handle(30, 'a')?;
    let b = table.insert_handle(10, 'b')?;
    let c = table.insert_handle(20, 'c')?;

    let _held = table.use_index(c)?;
    table.remove_index(c, false)?;

    assert_eq!(table.snapshot(), vec![(b, 10), (a, 30)]);
    Ok(())
}

// A slot must never be handed to a later insert while any user still holds a
// reference to it. Users stamp their element and check it never changes while
// the reference is alive.
#[test]
fn test_slot_never_reused_while_referenced() -> Result<()> {
    let table = Arc::new(HandleTable::new("stress", 4)?);
    let stop = Arc::new(AtomicBool::new(false));
    let n_users = 4;
    let barrier = Arc::new(Barrier::new(n_users + 1));

    let users = (0..n_users)
        .map(|_| {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();
                let mut observed = 0usize;

                while !stop.load(Ordering::Relaxed) {
                    for index in 0..table.capacity() {
                        if let Ok(element) = table.use_index(index) {
                            let stamp: u64 = *element;
                            thread::yield_now();
                            assert_eq!(*element, stamp);
                            assert!(table.ref_count(index).unwrap_or(0) >= 1);
                            observed += 1;
                        }
                    }
                }

                observed
            })
        })
        .collect::<Vec<_>>();

    barrier.wait();

    let mut live = HashSet::new();
    for round in 0..2_000u64 {
        match table.insert(round) {
            Ok(index) => {
                live.insert(index);
            }
            Err(_) => match live.iter().next().copied() {
                Some(victim) => {
                    table.remove_index(victim, false)?;
                    live.remove(&victim);
                }
                // Every slot is pending removal behind a user reference.
                None => thread::yield_now(),
            },
        }
    }

    stop.store(true, Ordering::Relaxed);
    for user in users {
        user.join().expect("user thread panicked");
    }

    for index in live {
        assert_eq!(table.ref_count(index), Some(0));
    }
    Ok(())
}

#[test]
fn test_use_during_concurrent_expansion() -> Result<()> {
    let table = Arc::new(HandleTable::new("grow", 2)?);
    let first = table.insert(1000u64)?;

    let reader = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for _ in 0..10_000 {
                assert_eq!(*table.use_index(first).unwrap(), 1000);
            }
        })
    };

    for i in 0..64 {
        table.insert_or_expand(None, i)?;
    }

    reader.join().expect("reader panicked");
    assert_eq!(table.capacity(), 128);
    Ok(())
}
