//! Integration tests for the store: dispatch serialization, autorun
//! memoization, fault containment, and snapshot roundtrips.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use strand_core::error::ReduceError;
use strand_core::{
    select, Action, DispatchError, Event, JsonFileSink, JsonFileSource, ReduceResult,
    ReducerFault, Reduction, SelectorPath, SliceReducer, Store, StoreConfig, SubscribeOptions,
};
use strand_types::{SliceName, Version};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

#[derive(Debug, Clone)]
enum CounterAction {
    Init,
    Increment,
    Add(i64),
    Noop,
    Bad,
}

struct CounterReducer;

impl SliceReducer for CounterReducer {
    type State = Counter;
    type Action = CounterAction;

    fn reduce(&self, state: Option<&Counter>, action: &CounterAction) -> ReduceResult<Counter> {
        match (state, action) {
            (None, CounterAction::Init) => Ok(Reduction::new(Counter { value: 0 })),
            (None, _) => Err(ReduceError::RequiresState),
            (Some(s), CounterAction::Init) | (Some(s), CounterAction::Noop) => {
                Ok(Reduction::new(s.clone()))
            }
            (Some(s), CounterAction::Increment) => Ok(Reduction::new(Counter { value: s.value + 1 })
                .with_event(Event::new("counter/changed", s.value + 1))),
            (Some(s), CounterAction::Add(n)) => {
                Ok(Reduction::new(Counter { value: s.value + n }))
            }
            (Some(_), CounterAction::Bad) => panic!("bad action"),
        }
    }
}

fn counter_store() -> Store {
    let store = Store::new();
    store.register_reducer("counter", CounterReducer).unwrap();
    store
}

fn counter_value(store: &Store) -> i64 {
    store
        .state()
        .slice::<Counter>(&SliceName::new("counter"))
        .map(|c| c.value)
        .unwrap()
}

fn counter_selector(tree: &strand_core::StateTree) -> Option<i64> {
    tree.slice::<Counter>(&SliceName::new("counter"))
        .map(|c| c.value)
}

// Scenario A: three increments from two contexts land exactly once each.
#[test]
fn concurrent_increments_all_commit() {
    let store = Arc::new(counter_store());
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();

    let versions = Arc::new(Mutex::new(Vec::new()));
    let mut threads = Vec::new();
    for increments in [2usize, 1usize] {
        let store = Arc::clone(&store);
        let versions = Arc::clone(&versions);
        threads.push(thread::spawn(move || {
            for _ in 0..increments {
                let commit = store
                    .dispatch(Action::new("counter", CounterAction::Increment))
                    .unwrap();
                versions.lock().push(commit.version);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(counter_value(&store), 3);

    // Every commit observed a distinct prior version
    let mut versions = versions.lock().clone();
    versions.sort();
    versions.dedup();
    assert_eq!(versions, vec![Version(2), Version(3), Version(4)]);
}

// N concurrent dispatchers, N sequential commits, no lost updates.
#[test]
fn dispatches_are_linearized() {
    let store = Arc::new(counter_store());
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .dispatch(Action::new("counter", CounterAction::Increment))
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(counter_value(&store), 100);
    assert_eq!(store.version(), Version(101));
}

// Scenario B: Increment then Noop fires a memoized subscription once.
#[test]
fn memoized_subscription_skips_unchanged_values() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();
    // Let the init commit's pass finish before subscribing, so the first
    // value this subscription observes is the increment's
    store.sync();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    let _sub = store.subscribe(
        select::map(select::slice::<Counter>("counter"), |c| c.value),
        move |_: &i64| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store
        .dispatch(Action::new("counter", CounterAction::Noop))
        .unwrap();
    store.sync();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// A dispatch that changes nothing republishes the same tree allocation.
#[test]
fn noop_dispatch_keeps_tree_reference() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();

    let before = store.state();
    let commit = store
        .dispatch(Action::new("counter", CounterAction::Add(0)))
        .unwrap();

    assert!(!commit.changed);
    assert!(Arc::ptr_eq(&before, &store.state()));
    assert_eq!(store.metrics().noop_commits, 1);
}

// Scenario C: a faulting reducer fails its dispatch and nothing else.
#[test]
fn reducer_fault_leaves_store_usable() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();

    let err = store
        .dispatch(Action::new("counter", CounterAction::Bad))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Reducer(ReducerFault::Panicked { .. })
    ));
    assert_eq!(counter_value(&store), 0);

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    assert_eq!(counter_value(&store), 1);
}

#[test]
fn callback_sees_each_distinct_value_once() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();
    store.sync();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = Arc::clone(&seen);
    let _sub = store.subscribe(
        counter_selector,
        move |value: &i64| seen_in_cb.lock().push(*value),
        SubscribeOptions::default(),
    );

    for action in [
        CounterAction::Increment,
        CounterAction::Noop,
        CounterAction::Add(0),
        CounterAction::Increment,
        CounterAction::Add(5),
    ] {
        store.dispatch(Action::new("counter", action)).unwrap();
    }
    store.sync();

    assert_eq!(*seen.lock(), vec![1, 2, 7]);
}

#[test]
fn events_reach_handlers_registered_for_their_kind() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let _handler = store.on("counter/changed", move |event: &Event| {
        seen_in_handler
            .lock()
            .push(*event.downcast_ref::<i64>().unwrap());
    });
    let wrong_kind = Arc::new(AtomicUsize::new(0));
    let wrong_kind_in_handler = Arc::clone(&wrong_kind);
    let _other = store.on("unrelated", move |_: &Event| {
        wrong_kind_in_handler.fetch_add(1, Ordering::SeqCst);
    });

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store.sync();

    assert_eq!(*seen.lock(), vec![1, 2]);
    assert_eq!(wrong_kind.load(Ordering::SeqCst), 0);
}

#[test]
fn released_subscription_never_fires_again() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();
    store.sync();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    let sub = store.subscribe(
        counter_selector,
        move |_: &i64| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store.sync();
    sub.release();

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store.sync();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn selector_fault_is_isolated_and_recorded() {
    let store = counter_store();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();
    store.sync();

    let _faulty = store.subscribe(
        |_tree: &strand_core::StateTree| -> Option<i64> { panic!("selector boom") },
        |_: &i64| {},
        SubscribeOptions::default(),
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    let _healthy = store.subscribe(
        counter_selector,
        move |_: &i64| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store.sync();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let faults = store.faults();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].message.contains("selector boom"));
}

#[test]
fn path_subscription_follows_serialized_view() {
    let store = Store::new();
    store
        .register_persistent("counter", CounterReducer)
        .unwrap();
    store
        .dispatch(Action::new("counter", CounterAction::Init))
        .unwrap();
    store.sync();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = Arc::clone(&seen);
    let path = SelectorPath::parse("counter.value").unwrap();
    let _sub = store.subscribe_path(
        path.clone(),
        move |value: &serde_json::Value| seen_in_cb.lock().push(value.clone()),
        SubscribeOptions::default(),
    );

    store
        .dispatch(Action::new("counter", CounterAction::Increment))
        .unwrap();
    store.sync();

    assert_eq!(*seen.lock(), vec![serde_json::json!(1)]);
    assert_eq!(store.select_path(&path).unwrap(), serde_json::json!(1));
}

#[test]
fn snapshots_roundtrip_through_sink_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = Store::builder()
            .config(StoreConfig {
                snapshot_every: Some(1),
                ..StoreConfig::default()
            })
            .sink(JsonFileSink::new(&path))
            .build();
        store
            .register_persistent("counter", CounterReducer)
            .unwrap();
        store
            .dispatch(Action::new("counter", CounterAction::Init))
            .unwrap();
        store
            .dispatch(Action::new("counter", CounterAction::Add(41)))
            .unwrap();
        store
            .dispatch(Action::new("counter", CounterAction::Increment))
            .unwrap();
        store.close();
    }

    let restored = Store::builder()
        .source(JsonFileSource::open(&path).unwrap())
        .build();
    restored
        .register_persistent("counter", CounterReducer)
        .unwrap();

    assert_eq!(counter_value(&restored), 42);
    // Hydration is a regular commit
    assert_eq!(restored.version(), Version(1));
}

// Replay determinism: the same action sequence always produces the same
// tree, bit for bit.
fn action_strategy() -> impl Strategy<Value = CounterAction> {
    prop_oneof![
        Just(CounterAction::Init),
        Just(CounterAction::Increment),
        Just(CounterAction::Noop),
        any::<i8>().prop_map(|n| CounterAction::Add(n as i64)),
    ]
}

proptest! {
    #[test]
    fn replaying_actions_is_deterministic(
        actions in proptest::collection::vec(action_strategy(), 0..32)
    ) {
        let first = counter_store();
        let second = counter_store();

        for action in &actions {
            let _ = first.dispatch(Action::new("counter", action.clone()));
        }
        for action in &actions {
            let _ = second.dispatch(Action::new("counter", action.clone()));
        }

        let first_state = first.state();
        let second_state = second.state();
        prop_assert_eq!(first_state.as_ref(), second_state.as_ref());
        prop_assert_eq!(first.version(), second.version());
    }
}
