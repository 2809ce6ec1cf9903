use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rhea::EventLoop;

mod util;

use self::util::{init, init_with_event_loop};

#[test]
fn wake_up_from_idle() {
    let event_loop = init_with_event_loop();
    let handle = event_loop.handle();

    let slot = Arc::new(AtomicUsize::new(0));
    let answer = slot.clone();
    let submitter = thread::spawn(move || {
        handle.run(move |event_loop| {
            answer.store(42, Ordering::SeqCst);
            event_loop.quit();
        });
    });

    // Blocks in the poll until the submission's wake-up arrives.
    event_loop.run_loop();
    submitter.join().unwrap();

    assert_eq!(slot.load(Ordering::SeqCst), 42);
    assert!(event_loop.loop_count() >= 1);
}

#[test]
fn quit_from_foreign_thread_interrupts_the_wait() {
    let event_loop = init_with_event_loop();
    let handle = event_loop.handle();

    let quitter = thread::spawn(move || handle.quit());

    // Without the wake-up this would sit in the poll for its full timeout.
    event_loop.run_loop();
    quitter.join().unwrap();
}

#[test]
fn cross_thread_tasks_drain_in_fifo_order() {
    const TASKS: usize = 10_000;

    let event_loop = init_with_event_loop();
    let handle = event_loop.handle();

    let order = Arc::new(Mutex::new(Vec::with_capacity(TASKS)));
    let producer_order = order.clone();
    let producer = thread::spawn(move || {
        for i in 0..TASKS {
            let order = producer_order.clone();
            handle.add_extra_task(move |_| order.lock().unwrap().push(i));
        }
        // FIFO per producer: the quit runs after all of the above.
        handle.add_extra_task(|event_loop| event_loop.quit());
    });

    event_loop.run_loop();
    producer.join().unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), TASKS);
    assert!(order.iter().enumerate().all(|(i, &task)| i == task));
    assert_eq!(event_loop.queued_task_count(), 0);
}

#[test]
fn tasks_enqueued_during_the_drain_run_next_iteration() {
    let event_loop = init_with_event_loop();
    let handle = event_loop.handle();

    let iterations = Arc::new(Mutex::new(Vec::new()));

    let first_iterations = iterations.clone();
    event_loop.add_extra_task(move |event_loop| {
        first_iterations.lock().unwrap().push(event_loop.loop_count());
        let next_iterations = first_iterations.clone();
        // The drain already swapped the queue: this must trigger its own
        // wake-up to be picked up by the next iteration.
        event_loop.add_extra_task(move |event_loop| {
            next_iterations.lock().unwrap().push(event_loop.loop_count());
            event_loop.quit();
        });
    });

    event_loop.wakeup();
    event_loop.run_loop();

    let iterations = iterations.lock().unwrap();
    assert_eq!(iterations.len(), 2);
    assert!(iterations[0] < iterations[1], "re-entrant task ran in the same drain");
}

#[test]
fn handle_outlives_the_loop() {
    init();
    let handle = {
        let event_loop = EventLoop::new().unwrap();
        event_loop.handle()
    };

    // The loop is gone; submissions go nowhere but must not crash.
    handle.run(|_| unreachable!("ran a task on a dropped event loop"));
    handle.wakeup();
    handle.quit();
}
