//! End-to-end acquisition scenarios

mod common;

use common::{Recorder, SingleSignal};
use daq_shared_memory::{SessionId, SubscriptionManager, SubscriptionMode};

fn periodic(decimation: u32, block_size: u32) -> SubscriptionMode {
    SubscriptionMode::Periodic {
        decimation,
        block_size,
    }
}

#[test]
fn test_every_tick_delivers_every_value() {
    let mut fx = SingleSignal::new(64);
    let mut session = SubscriptionManager::new([&fx.control]);
    session.subscribe(fx.signal, periodic(1, 1)).unwrap();

    for v in 1..=5 {
        fx.tick(v as f64);
    }

    let mut rec = Recorder::default();
    session.poll(&mut rec);
    assert_eq!(rec.lists, vec![(0, vec![0])]);
    assert_eq!(rec.f64_values(fx.signal), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(
        rec.data.iter().map(|d| d.seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
}

#[test]
fn test_decimation_two_delivers_every_other_tick() {
    let mut fx = SingleSignal::new(64);
    let mut session = SubscriptionManager::new([&fx.control]);
    session.subscribe(fx.signal, periodic(2, 1)).unwrap();

    let mut rec = Recorder::default();
    let mut delivered_at = Vec::new();
    for tick in 1..=4 {
        fx.tick(tick as f64);
        let before = rec.data.len();
        session.poll(&mut rec);
        if rec.data.len() > before {
            delivered_at.push(tick);
        }
    }

    assert_eq!(delivered_at, vec![2, 4]);
    assert_eq!(rec.f64_values(fx.signal), vec![2.0, 4.0]);
}

#[test]
fn test_late_attach_after_wrap_starts_at_now() {
    let mut fx = SingleSignal::new(3);
    // Another session keeps the signal transmitted.
    fx.control.subscribe(SessionId::next(), &[fx.signal]).unwrap();
    for v in 1..=5 {
        fx.tick(v as f64);
    }
    assert!(fx.task.stats().wraps > 0);

    let mut session = SubscriptionManager::new([&fx.control]);
    session.subscribe(fx.signal, periodic(1, 1)).unwrap();

    let mut rec = Recorder::default();
    session.poll(&mut rec);
    assert_eq!(rec.lists, vec![(0, vec![0])]);
    assert!(rec.data.is_empty());

    fx.tick(6.0);
    session.poll(&mut rec);
    assert_eq!(rec.f64_values(fx.signal), vec![6.0]);
    assert_eq!(session.cursor_stats(0).unwrap().lost_frames, 0);
}

#[test]
fn test_idle_reader_is_lapped_without_corruption() {
    let mut fx = SingleSignal::new(3);
    let mut session = SubscriptionManager::new([&fx.control]);
    session.subscribe(fx.signal, periodic(1, 1)).unwrap();

    for v in 1..=5 {
        fx.tick(v as f64);
    }

    let mut rec = Recorder::default();
    session.poll(&mut rec);

    // At most what the ring still holds, newest value last, no garbage.
    let values = rec.f64_values(fx.signal);
    assert!(!values.is_empty() && values.len() <= 3, "{values:?}");
    assert_eq!(values.last(), Some(&5.0));
    assert!(values.iter().all(|v| (1.0..=5.0).contains(v)));
    assert!(values.windows(2).all(|w| w[0] < w[1]));

    let stats = session.cursor_stats(0).unwrap();
    assert!(stats.resyncs >= 1);
    assert_eq!(stats.malformed, 0);

    // Back in step afterwards.
    fx.tick(6.0);
    session.poll(&mut rec);
    assert_eq!(rec.f64_values(fx.signal).last(), Some(&6.0));
}

#[test]
fn test_shared_signal_removed_once() {
    let mut fx = SingleSignal::new(16);
    let mut first = SubscriptionManager::new([&fx.control]);
    let mut second = SubscriptionManager::new([&fx.control]);
    first.subscribe(fx.signal, periodic(1, 1)).unwrap();
    second.subscribe(fx.signal, SubscriptionMode::Event).unwrap();
    fx.tick(1.0);
    assert_eq!(fx.task.stats().inserts, 1);

    first.unsubscribe(fx.signal).unwrap();
    fx.tick(2.0);
    assert_eq!(fx.task.transmitted_signals(), &[0]);
    assert_eq!(fx.task.stats().removes, 0);
    assert_eq!(fx.control.interest_count(fx.signal), 1);

    second.unsubscribe(fx.signal).unwrap();
    fx.tick(3.0);
    assert!(fx.task.transmitted_signals().is_empty());
    assert_eq!(fx.task.stats().removes, 1);

    let mut rec = Recorder::default();
    second.poll(&mut rec);
    assert_eq!(rec.lists.last(), Some(&(0, vec![])));
}

#[test]
fn test_disconnect_unsubscribes() {
    let mut fx = SingleSignal::new(16);
    {
        let mut session = SubscriptionManager::new([&fx.control]);
        session.subscribe(fx.signal, periodic(1, 1)).unwrap();
        fx.tick(1.0);
        assert_eq!(fx.task.transmitted_signals(), &[0]);
    }
    fx.tick(2.0);
    assert!(fx.task.transmitted_signals().is_empty());
    assert_eq!(fx.control.interest_count(fx.signal), 0);
}
