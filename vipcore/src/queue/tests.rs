use super::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::thread;

assert_impl_all!(SubmitQueue: Send, Sync);

fn entry(descriptor: usize, subtask: usize, cores: CoreMask, priority: u32) -> QueueEntry {
    QueueEntry {
        task_id: TaskId::from_index(descriptor)
            .and_then(|id| id.with_subtask(subtask))
            .unwrap(),
        cores,
        priority,
        estimated_time: None,
    }
}

#[rstest]
#[case::fifo(QueueKind::default())]
#[case::priority(QueueKind::Priority)]
fn test_fifo_order_under_single_core(#[case] kind: QueueKind) -> Result<()> {
    let queue = SubmitQueue::new(kind);
    let core0 = CoreMask::single(0);

    let written = (0..3).map(|i| entry(i, 0, core0, 0)).collect::<Vec<_>>();
    for e in &written {
        queue.write(*e)?;
    }

    let drained = std::iter::from_fn(|| queue.read(core0)).collect::<Vec<_>>();
    assert_eq!(drained, written);
    Ok(())
}

#[test]
fn test_fifo_capacity() -> Result<()> {
    let queue = SubmitQueue::new(QueueKind::Fifo { capacity: 2 });
    let core0 = CoreMask::single(0);

    queue.write(entry(0, 0, core0, 0))?;
    queue.write(entry(1, 0, core0, 0))?;

    let err = queue.write(entry(2, 0, core0, 0)).unwrap_err();
    assert!(err.is_retryable());

    queue.read(core0);
    assert!(queue.write(entry(2, 0, core0, 0)).is_ok());
    Ok(())
}

#[test]
fn test_read_skips_entries_waiting_for_busy_cores() -> Result<()> {
    let queue = SubmitQueue::new(QueueKind::default());

    let both = entry(0, 0, CoreMask::from_range(0, 2)?, 0);
    let second = entry(1, 0, CoreMask::single(1), 0);
    queue.write(both)?;
    queue.write(second)?;

    // Core 0 busy: only the single-core entry fits.
    assert_eq!(queue.read(CoreMask::single(1)), Some(second));
    assert_eq!(queue.read(CoreMask::single(1)), None);
    assert_eq!(queue.read(CoreMask::all(2)), Some(both));
    Ok(())
}

#[test]
fn test_priority_then_insertion_order() -> Result<()> {
    let queue = SubmitQueue::new(QueueKind::Priority);
    let core0 = CoreMask::single(0);

    let low = entry(0, 0, core0, 1);
    let high_a = entry(1, 0, core0, 9);
    let high_b = entry(2, 0, core0, 9);
    let mid = entry(3, 0, core0, 5);

    for e in [low, high_a, high_b, mid] {
        queue.write(e)?;
    }

    let drained = std::iter::from_fn(|| queue.read(core0)).collect::<Vec<_>>();
    assert_eq!(drained, vec![high_a, high_b, mid, low]);
    Ok(())
}

#[test]
fn test_stop_rejects_writes_but_drains() -> Result<()> {
    let queue = SubmitQueue::new(QueueKind::default());
    let core0 = CoreMask::single(0);

    let pending = entry(0, 0, core0, 0);
    queue.write(pending)?;
    queue.stop();

    assert!(queue.is_stopped());
    assert!(matches!(
        queue.write(entry(1, 0, core0, 0)),
        Err(VipError::Failure(_))
    ));
    assert_eq!(queue.read(core0), Some(pending));
    assert!(queue.is_empty());
    Ok(())
}

#[test]
fn test_clean_filters() -> Result<()> {
    let queue = SubmitQueue::new(QueueKind::default());
    let core0 = CoreMask::single(0);

    let a0 = entry(0, 0, core0, 0);
    let a1 = entry(0, 1, core0, 0);
    let b0 = entry(1, 0, core0, 0);
    let b1 = entry(1, 1, core0, 0);
    for e in [a0, b0, a1, b1] {
        queue.write(e)?;
    }

    assert_eq!(queue.clean(CleanFilter::Entry(b1.task_id)), vec![b1]);
    assert_eq!(
        queue.clean(CleanFilter::Descriptor(a0.task_id)),
        vec![a0, a1]
    );
    assert_eq!(queue.clean(CleanFilter::All), vec![b0]);
    assert!(queue.is_empty());
    Ok(())
}

#[test]
fn test_write_wakes_waiting_reader() -> Result<()> {
    let queue = Arc::new(SubmitQueue::new(QueueKind::default()));
    let core0 = CoreMask::single(0);

    let reader = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            loop {
                if let Some(e) = queue.read(core0) {
                    return Some(e);
                }
                if !queue.wait(Some(Duration::from_secs(5))) {
                    return None;
                }
            }
        })
    };

    thread::sleep(Duration::from_millis(10));
    let e = entry(4, 0, core0, 0);
    queue.write(e)?;

    assert_eq!(reader.join().expect("reader panicked"), Some(e));
    Ok(())
}
