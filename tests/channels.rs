use std::cell::Cell;
use std::rc::Rc;

use rhea::Channel;

mod util;

use self::util::{init_with_event_loop, run_for, TestFd};

#[test]
fn read_callback_runs_when_the_descriptor_is_ready() {
    let event_loop = init_with_event_loop();
    let test_fd = TestFd::new();

    let reads = Rc::new(Cell::new(0u32));
    let channel = Channel::new(&event_loop, test_fd.fd());
    let counter = reads.clone();
    channel.set_read_callback(move |_now| counter.set(counter.get() + 1));
    channel.enable_reading();

    test_fd.make_readable();
    run_for(&event_loop, 0.03);

    // Level-triggered and never drained: one dispatch per iteration.
    assert!(reads.get() >= 1);
    assert!(event_loop.has_channel(&channel));

    channel.disable_all();
    channel.remove();
}

#[test]
fn tie_protects_against_a_dropped_owner() {
    let event_loop = init_with_event_loop();

    // The channel of a destroyed owner: its callbacks must not run.
    let dead_fd = TestFd::new();
    let dead_owner = Rc::new(());
    let dead_channel = Channel::new(&event_loop, dead_fd.fd());
    dead_channel.set_read_callback(move |_now| panic!("dispatched without a live owner"));
    dead_channel.tie(&dead_owner);
    dead_channel.enable_reading();

    // A second, untied channel: the loop keeps dispatching others.
    let live_fd = TestFd::new();
    let live_channel = Channel::new(&event_loop, live_fd.fd());
    let reads = Rc::new(Cell::new(0u32));
    let counter = reads.clone();
    live_channel.set_read_callback(move |_now| counter.set(counter.get() + 1));
    live_channel.enable_reading();

    dead_fd.make_readable();
    live_fd.make_readable();
    drop(dead_owner);

    run_for(&event_loop, 0.03);
    assert!(reads.get() >= 1);

    dead_channel.disable_all();
    dead_channel.remove();
    live_channel.disable_all();
    live_channel.remove();
}

#[test]
fn enable_disable_remove_round_trip() {
    let event_loop = init_with_event_loop();
    let test_fd = TestFd::new();
    let channel = Channel::new(&event_loop, test_fd.fd());

    assert!(!event_loop.has_channel(&channel));
    assert!(channel.is_none_event());

    channel.enable_reading();
    assert!(event_loop.has_channel(&channel));
    assert!(channel.is_reading());
    assert!(!channel.is_writing());

    channel.enable_writing();
    assert!(channel.is_writing());

    channel.disable_reading();
    channel.disable_writing();
    assert!(channel.is_none_event());
    // Disabled but not removed: the loop still knows the channel.
    assert!(event_loop.has_channel(&channel));

    channel.remove();
    assert!(!event_loop.has_channel(&channel));
    assert!(!channel.is_in_loop());

    // A removed channel can come back.
    channel.enable_reading();
    assert!(event_loop.has_channel(&channel));
    assert!(channel.is_in_loop());
    channel.disable_all();
    channel.remove();
}

#[test]
fn write_callback_runs_while_writable() {
    let event_loop = init_with_event_loop();
    let test_fd = TestFd::new();

    // An eventfd far from its counter limit is always writable.
    let channel = Channel::new(&event_loop, test_fd.fd());
    let writes = Rc::new(Cell::new(0u32));
    let counter = writes.clone();
    channel.set_write_callback(move || counter.set(counter.get() + 1));
    channel.enable_writing();

    let disable = channel.clone();
    let _ = event_loop.run_after(0.03, move || disable.disable_writing());

    // Snapshot a little after the disable so an already-collected dispatch
    // from the same iteration has finished.
    let snapshot = Rc::new(Cell::new(0u32));
    let record = snapshot.clone();
    let recorded = writes.clone();
    let _ = event_loop.run_after(0.05, move || record.set(recorded.get()));

    run_for(&event_loop, 0.08);

    assert!(snapshot.get() >= 1);
    // No further dispatches once writing was disabled.
    assert_eq!(writes.get(), snapshot.get());
    assert!(channel.is_none_event());

    channel.remove();
}
