//! Demo host: a main loop draining the dispatcher every frame while work
//! arrives from the main thread and from a second thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    let dispatcher = Arc::new(tickpool::Dispatcher::new());

    dispatcher.submit_sync(|| {
        println!("synchronous task");
    });

    dispatcher.submit_async(
        || {
            println!("background task");
        },
        |outcome| {
            println!("main-thread callback ({:?})", outcome);
        },
    );

    let stop = Arc::new(AtomicBool::new(false));

    // Late submission from another thread
    let d = dispatcher.clone();
    let s = stop.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        let s = s.clone();
        d.submit_async(
            || {
                println!("late background task");
            },
            move |_| {
                println!("late main-thread callback");
                s.store(true, Ordering::Release);
            },
        );
    });

    // The host engine would invoke drain every frame; it finishes tasks and
    // runs their callbacks on this thread
    while !stop.load(Ordering::Acquire) {
        dispatcher.drain();
        thread::sleep(Duration::from_millis(16));
    }
}
