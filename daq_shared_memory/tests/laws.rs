//! Delivery laws checked over generated inputs

mod common;

use common::{Recorder, SingleSignal};
use daq_shared_memory::{SessionId, SubscriptionManager, SubscriptionMode};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// One delivery every D*B ticks, each carrying exactly B samples.
    #[test]
    fn prop_decimation_law(decimation in 0u32..6, block_size in 0u32..5, periods in 1usize..4) {
        let d = decimation.max(1) as usize;
        let b = block_size.max(1) as usize;
        let ticks = d * b * periods;

        let mut fx = SingleSignal::new(ticks + 4);
        let mut session = SubscriptionManager::new([&fx.control]);
        session
            .subscribe(fx.signal, SubscriptionMode::Periodic { decimation, block_size })
            .unwrap();

        let mut rec = Recorder::default();
        let mut due_ticks = Vec::new();
        for tick in 1..=ticks {
            fx.tick(tick as f64);
            let before = rec.data.len();
            session.poll(&mut rec);
            if rec.data.len() > before {
                due_ticks.push(tick);
            }
        }

        let expected: Vec<usize> = (1..=periods).map(|k| k * d * b).collect();
        prop_assert_eq!(due_ticks, expected);

        for (k, block) in rec.f64_blocks(fx.signal).iter().enumerate() {
            let want: Vec<f64> = (1..=b).map(|i| (k * d * b + i * d) as f64).collect();
            prop_assert_eq!(block, &want);
        }
    }

    /// A change-triggered subscription delivers exactly when the bytes change.
    #[test]
    fn prop_event_law(values in proptest::collection::vec(0u8..3, 1..40)) {
        let mut fx = SingleSignal::new(values.len() + 4);
        let mut session = SubscriptionManager::new([&fx.control]);
        session.subscribe(fx.signal, SubscriptionMode::Event).unwrap();

        let mut rec = Recorder::default();
        for &v in &values {
            fx.tick(v as f64);
        }
        session.poll(&mut rec);

        let expected: Vec<f64> = values
            .iter()
            .enumerate()
            .filter(|(i, v)| *i == 0 || values[i - 1] != **v)
            .map(|(_, v)| *v as f64)
            .collect();
        prop_assert_eq!(rec.f64_values(fx.signal), expected);
    }

    /// Sequence numbers seen by a reader are strictly increasing, whether or
    /// not it gets lapped between polls.
    #[test]
    fn prop_sequence_numbers_increase(bursts in proptest::collection::vec(1usize..12, 1..10)) {
        let mut fx = SingleSignal::new(4);
        let mut session = SubscriptionManager::new([&fx.control]);
        session.subscribe(fx.signal, SubscriptionMode::EVERY_TICK).unwrap();

        let mut rec = Recorder::default();
        let mut tick = 0;
        for burst in bursts {
            for _ in 0..burst {
                tick += 1;
                fx.tick(tick as f64);
            }
            session.poll(&mut rec);
        }

        let seqs: Vec<u32> = rec.data.iter().map(|d| d.seq).collect();
        prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{:?}", seqs);
        // Value written at tick t travels in data frame t-1.
        for d in &rec.data {
            let v = f64::from_ne_bytes(d.values[0].2[..8].try_into().unwrap());
            prop_assert_eq!(v, (d.seq + 1) as f64);
        }
    }
}

#[test]
fn test_subscribe_unsubscribe_round_trip_emits_nothing() {
    let mut fx = SingleSignal::new(8);
    fx.tick(0.0);
    let baseline = fx.task.stats();

    let mut session = SubscriptionManager::new([&fx.control]);
    session.subscribe(fx.signal, SubscriptionMode::EVERY_TICK).unwrap();
    session.unsubscribe(fx.signal).unwrap();
    fx.tick(1.0);

    let stats = fx.task.stats();
    assert_eq!(stats.inserts, baseline.inserts + 1);
    assert_eq!(stats.removes, baseline.removes + 1);
    assert_eq!(stats.list_frames, baseline.list_frames);
    assert_eq!(stats.data_frames, baseline.data_frames);
    assert!(fx.task.transmitted_signals().is_empty());
}

#[test]
fn test_list_precedes_dependent_data() {
    let mut fx = SingleSignal::new(32);
    let mut session = SubscriptionManager::new([&fx.control]);
    let other = SessionId::next();

    session.subscribe(fx.signal, SubscriptionMode::EVERY_TICK).unwrap();
    fx.tick(1.0);
    fx.control.subscribe(other, &[fx.signal]).unwrap();
    fx.tick(2.0);
    session.unsubscribe(fx.signal).unwrap();
    fx.tick(3.0);
    fx.control.unsubscribe(other, &[fx.signal]).unwrap();
    fx.tick(4.0);

    let mut rec = Recorder::default();
    session.poll(&mut rec);
    // Transmitted from tick 1 to 3, then the empty list.
    assert_eq!(rec.lists, vec![(0, vec![0]), (0, vec![])]);
    assert_eq!(rec.f64_values(fx.signal), vec![1.0, 2.0]);
}
