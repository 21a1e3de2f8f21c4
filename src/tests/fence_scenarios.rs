// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Fence Integration Tests
//!
//! Aggregates over many producers and waiters on other threads.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::thread;
use test_case::test_case;

use super::XorShift;
use crate::fence::tests::test_fence;
use crate::fence::{Fence, FenceArray, FenceChain, FenceRef};
use crate::sync::WaitQueue;
use crate::workqueue::{self, Work};

fn signal_counter(fence: &FenceRef) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    fence
        .add_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    count
}

/// The aggregate signals once, and only after the last child
#[test_case(1, 0x9e37_79b9 ; "one child")]
#[test_case(5, 0x2545_f491 ; "five children")]
#[test_case(50, 0x1234_5678 ; "fifty children")]
fn test_array_all_signals_after_last_in_any_order(n: usize, seed: u64) {
    let ctx = Fence::context_alloc(1);
    let kids: Vec<_> = (1..=n as u64).map(|s| test_fence(ctx, s)).collect();
    let array = FenceArray::create(kids.clone(), Fence::context_alloc(1), 1, false).unwrap();
    let signals = signal_counter(&array);

    let mut order: Vec<usize> = (0..n).collect();
    XorShift::new(seed).shuffle(&mut order);

    let (last, rest) = order.split_last().unwrap();
    for &idx in rest {
        kids[idx].signal().unwrap();
    }
    workqueue::flush_deferred();
    assert!(!array.is_signaled());
    assert_eq!(signals.load(Ordering::SeqCst), 0);

    kids[*last].signal().unwrap();
    array.wait(false).unwrap();
    workqueue::flush_deferred();
    assert_eq!(signals.load(Ordering::SeqCst), 1);

    // Repeated signals change nothing.
    for kid in &kids {
        assert!(kid.signal().is_err());
    }
    workqueue::flush_deferred();
    assert_eq!(signals.load(Ordering::SeqCst), 1);
}

#[test_case(1 ; "one child")]
#[test_case(5 ; "five children")]
#[test_case(50 ; "fifty children")]
fn test_array_any_signals_after_first(n: usize) {
    let ctx = Fence::context_alloc(1);
    let kids: Vec<_> = (1..=n as u64).map(|s| test_fence(ctx, s)).collect();
    let array = FenceArray::create(kids.clone(), Fence::context_alloc(1), 1, true).unwrap();
    let signals = signal_counter(&array);

    let mut order: Vec<usize> = (0..n).collect();
    XorShift::new(n as u64).shuffle(&mut order);

    kids[order[0]].signal().unwrap();
    array.wait(false).unwrap();
    for &idx in &order[1..] {
        kids[idx].signal().unwrap();
    }
    workqueue::flush_deferred();
    assert_eq!(signals.load(Ordering::SeqCst), 1);
}

#[test]
fn test_array_children_signaled_from_many_threads() {
    let ctx = Fence::context_alloc(1);
    let kids: Vec<_> = (1..=16u64).map(|s| test_fence(ctx, s)).collect();
    let array = FenceArray::create(kids.clone(), Fence::context_alloc(1), 1, false).unwrap();
    array.enable_sw_signaling();

    let producers: Vec<_> = kids
        .into_iter()
        .map(|kid| {
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(kid.seqno() % 4));
                kid.signal().unwrap();
            })
        })
        .collect();

    assert_eq!(
        array.wait_timeout(false, Duration::from_secs(10)).map(|_| ()),
        Ok(())
    );
    for p in producers {
        p.join().unwrap();
    }
}

#[test]
fn test_waiters_never_miss_a_signal() {
    for _ in 0..50 {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let fence = fence.clone();
                thread::spawn(move || fence.wait(false))
            })
            .collect();
        fence.signal().unwrap();
        for w in waiters {
            assert_eq!(w.join().unwrap(), Ok(()));
        }
    }
}

#[test]
fn test_array_of_chains() {
    // Two timelines; the array waits for the head of each.
    let timeline = |n: u64| {
        let ctx = Fence::context_alloc(1);
        let points: Vec<_> = (1..=n).map(|s| test_fence(ctx, s)).collect();
        let mut head: Option<FenceRef> = None;
        for (i, p) in points.iter().enumerate() {
            head = Some(FenceChain::create(head, p.clone(), i as u64 + 1));
        }
        (points, head.unwrap())
    };
    let (a_points, a_head) = timeline(3);
    let (b_points, b_head) = timeline(2);
    let array = FenceArray::create(vec![a_head, b_head], Fence::context_alloc(1), 1, false).unwrap();
    array.enable_sw_signaling();

    for p in a_points.iter().chain(b_points.iter()).rev() {
        assert!(!array.is_signaled());
        p.signal().unwrap();
    }
    assert_eq!(
        array.wait_timeout(false, Duration::from_secs(10)).map(|_| ()),
        Ok(())
    );
}

#[test]
fn test_stub_is_always_signaled() {
    let stub = Fence::stub();
    assert!(stub.is_signaled());
    assert_eq!(stub.wait_timeout(false, Duration::ZERO), Ok(Duration::ZERO));
    let array = FenceArray::create(vec![stub], Fence::context_alloc(1), 1, false).unwrap();
    assert!(array.is_signaled());
}

/// Every system queue worker waits on composites whose last child signals
/// later; the deferred aggregate signals must still get through.
#[test]
fn test_composite_waits_from_every_system_worker() {
    let wq = workqueue::system_wq().unwrap();
    let n = wq.num_workers();
    let results = Arc::new(WaitQueue::with_state(Vec::new()));

    let items: Vec<Work> = (0..n)
        .map(|_| {
            let results = results.clone();
            Work::new(move |_| {
                let ctx = Fence::context_alloc(1);
                let kids = vec![test_fence(ctx, 1), test_fence(ctx, 2)];
                let array = FenceArray::create(kids.clone(), Fence::context_alloc(1), 1, false).unwrap();
                let chain = FenceChain::create(None, kids[1].clone(), 1);
                array.enable_sw_signaling();
                chain.enable_sw_signaling();

                let producer = thread::spawn(move || {
                    thread::sleep(std::time::Duration::from_millis(20));
                    for kid in &kids {
                        kid.signal().unwrap();
                    }
                });
                let waited = (
                    array.wait_timeout(false, Duration::from_secs(5)).map(|_| ()),
                    chain.wait_timeout(false, Duration::from_secs(5)).map(|_| ()),
                );
                producer.join().unwrap();

                let mut results = results.lock();
                results.push(waited);
                results.wake_all();
            })
        })
        .collect();
    for (cpu, item) in items.iter().enumerate() {
        assert!(wq.queue_on(cpu, item));
    }

    assert_eq!(
        results
            .wait_event_timeout(|r| r.len() == n, Duration::from_secs(20))
            .map(|_| ()),
        Ok(())
    );
    for waited in results.lock().iter() {
        assert_eq!(*waited, (Ok(()), Ok(())));
    }
}
