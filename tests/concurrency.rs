// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet workers hitting the proxy from several threads at once.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use igmp_proxy::config::ProxyConfig;
use igmp_proxy::FlowAction;

const GROUP: &str = "239.10.10.10";

fn fast_leave() -> ProxyConfig {
    ProxyConfig {
        fast_leave: true,
        ..config()
    }
}

#[test]
fn test_simultaneous_joins_on_one_key() {
    let h = Arc::new(Harness::new());
    let barrier = Arc::new(Barrier::new(8));
    let frame = v3_join(GROUP, None);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let h = Arc::clone(&h);
            let barrier = Arc::clone(&barrier);
            let frame = frame.clone();
            thread::spawn(move || {
                barrier.wait();
                h.send_on(1, &frame, 0);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(h.table_len(), 1);
    assert_eq!(h.upstream(), vec![Upstream::Join(ip(GROUP), vec![])]);
    assert_eq!(h.flows.count(FlowAction::Add), 1);

    let stats = h.proxy.statistics();
    assert_eq!(stats.joins, 1);
    assert_eq!(stats.rejoins, 7);
}

#[test]
fn test_independent_ports_churn() {
    let h = Arc::new(Harness::with_config(fast_leave()));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (1..=8u32)
        .map(|port| {
            let h = Arc::clone(&h);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let join = v3_join(GROUP, None);
                let leave = v2_leave(GROUP);
                barrier.wait();
                for i in 0..100 {
                    h.send_on(port, &join, i);
                    h.send_on(port, &leave, i);
                }
                h.send_on(port, &join, 100);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(h.table_len(), 8);
    let adds = h.flows.count(FlowAction::Add);
    let removes = h.flows.count(FlowAction::Remove);
    assert_eq!(adds - removes, 8);

    let stats = h.proxy.statistics();
    assert_eq!(stats.joins, 808);
    assert_eq!(stats.leaves, 800);
    assert_eq!(stats.upstream_joins - stats.upstream_leaves, 8);
}

#[test]
fn test_contended_key_stays_consistent() {
    let h = Arc::new(Harness::with_config(fast_leave()));
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let h = Arc::clone(&h);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let join = v3_join(GROUP, None);
                let leave = v2_leave(GROUP);
                barrier.wait();
                for i in 0..200 {
                    if (i + worker) % 3 == 0 {
                        h.send_on(1, &leave, i);
                    } else {
                        h.send_on(1, &join, i);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let member = h.table_len() == 1;
    let adds = h.flows.count(FlowAction::Add);
    let removes = h.flows.count(FlowAction::Remove);
    let stats = h.proxy.statistics();

    assert_eq!(adds - removes, usize::from(member));
    assert_eq!(
        stats.upstream_joins - stats.upstream_leaves,
        u64::from(member)
    );
    assert_eq!(stats.joins - stats.leaves, u64::from(member));

    // Upstream messages alternate join/leave for the single aggregate
    let upstream = h.upstream();
    for pair in upstream.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}
