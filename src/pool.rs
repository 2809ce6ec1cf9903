//! Worker threads running dedicated event loops.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error};
use rand::Rng;

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback run on each worker's own thread, against the worker's loop,
/// before the loop starts. Shared across all workers of a pool.
type InitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// What the worker thread has published so far.
enum Startup {
    Pending,
    Ready(LoopHandle),
    Failed,
}

/// A named worker thread owning one [`EventLoop`] on its own stack.
///
/// [`start`] spawns the thread and blocks until the worker's loop is up,
/// returning its handle. Dropping the worker asks the loop to quit and joins
/// the thread.
///
/// [`start`]: EventLoopThread::start
pub struct EventLoopThread {
    name: String,
    init: Option<InitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates a not-yet-started worker named `name`.
    pub fn new<S: Into<String>>(name: S) -> EventLoopThread {
        EventLoopThread::with_shared_init(name.into(), None)
    }

    /// Creates a not-yet-started worker which runs `init` against its loop
    /// before entering it.
    pub fn with_init<S, F>(name: S, init: F) -> EventLoopThread
    where
        S: Into<String>,
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        EventLoopThread::with_shared_init(name.into(), Some(Arc::new(init)))
    }

    pub(crate) fn with_shared_init(name: String, init: Option<InitCallback>) -> EventLoopThread {
        EventLoopThread {
            name,
            init,
            handle: None,
            thread: None,
        }
    }

    /// Spawns the worker thread and blocks until its event loop is running,
    /// returning a handle to it.
    ///
    /// # Panics
    ///
    /// Panics when the worker was already started, when the OS refuses to
    /// spawn a thread, or when the worker fails to create its event loop.
    pub fn start(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "event loop worker already started");

        let startup = Arc::new((Mutex::new(Startup::Pending), Condvar::new()));
        let worker_startup = Arc::clone(&startup);
        let init = self.init.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker_main(init, worker_startup))
            .expect("failed to spawn event loop worker thread");
        self.thread = Some(thread);

        let (lock, ready) = &*startup;
        let mut state = lock.lock().unwrap();
        loop {
            match &*state {
                Startup::Pending => {}
                Startup::Ready(handle) => {
                    let handle = handle.clone();
                    self.handle = Some(handle.clone());
                    return handle;
                }
                Startup::Failed => panic!("event loop worker {:?} failed to start", self.name),
            }
            state = ready.wait(state).unwrap();
        }
    }

    /// Handle to the worker's loop; `None` until [`start`] returned.
    ///
    /// [`start`]: EventLoopThread::start
    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }

    /// The worker's thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("started", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            debug!("joining event loop worker {:?}", self.name);
            if thread.join().is_err() {
                error!("event loop worker {:?} panicked", self.name);
            }
        }
    }
}

fn worker_main(init: Option<InitCallback>, startup: Arc<(Mutex<Startup>, Condvar)>) {
    let (lock, ready) = &*startup;

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!("worker failed to create its event loop: {}", err);
            *lock.lock().unwrap() = Startup::Failed;
            ready.notify_one();
            return;
        }
    };

    if let Some(init) = init {
        init(&event_loop);
    }

    *lock.lock().unwrap() = Startup::Ready(event_loop.handle());
    ready.notify_one();

    event_loop.run_loop();
}

/// A pool of worker threads, each running one [`EventLoop`], fed from a
/// "base" loop.
///
/// The base loop is the caller's own loop, typically the one an acceptor
/// runs on; [`next_loop`] and [`random_loop`] pick a worker to hand new work
/// to, falling back to the base loop when the pool has no workers. Dropping
/// the pool quits and joins every worker.
///
/// [`next_loop`]: EventLoopThreadPool::next_loop
/// [`random_loop`]: EventLoopThreadPool::random_loop
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    thread_count: usize,
    next: usize,
    workers: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    /// Creates an empty, not-yet-started pool. Worker threads are named
    /// `"<name><index>"`.
    pub fn new<S: Into<String>>(base: LoopHandle, name: S) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: false,
            thread_count: 0,
            next: 0,
            workers: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the number of worker threads. Must be called before [`start`];
    /// the pool cannot be resized afterwards.
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn set_thread_count(&mut self, count: usize) {
        assert!(!self.started, "cannot resize a started pool");
        self.thread_count = count;
    }

    /// Starts every worker, blocking until all of their loops are running.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the base loop's, or when
    /// the pool was already started.
    pub fn start(&mut self) {
        self.start_inner(None);
    }

    /// Like [`start`], additionally running `init` on each worker's thread
    /// against the worker's loop before it starts looping. With zero workers
    /// `init` runs once, against the base loop.
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn start_with_init<F>(&mut self, init: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        self.start_inner(Some(Arc::new(init)));
    }

    fn start_inner(&mut self, init: Option<InitCallback>) {
        assert!(
            self.base.in_loop_thread(),
            "pool must be started from its base loop's thread"
        );
        assert!(!self.started, "pool already started");
        self.started = true;

        debug!("starting pool {:?}: {} workers", self.name, self.thread_count);
        for i in 0..self.thread_count {
            let name = format!("{}{}", self.name, i);
            let mut worker = EventLoopThread::with_shared_init(name, init.clone());
            self.loops.push(worker.start());
            self.workers.push(worker);
        }

        if self.thread_count == 0 {
            if let Some(init) = init {
                match EventLoop::current() {
                    // Without workers the base loop doubles as the worker.
                    Some(event_loop) => init(&event_loop),
                    None => error!("pool {:?} started without a current loop", self.name),
                }
            }
        }
    }

    /// Returns the next worker loop, round-robin; the base loop when the
    /// pool has no workers.
    pub fn next_loop(&mut self) -> LoopHandle {
        self.assert_in_base_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }

        let handle = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        handle
    }

    /// Returns a uniformly chosen worker loop; the base loop when the pool
    /// has no workers.
    pub fn random_loop(&self) -> LoopHandle {
        self.assert_in_base_thread();
        if self.loops.is_empty() {
            self.base.clone()
        } else {
            let index = rand::thread_rng().gen_range(0..self.loops.len());
            self.loops[index].clone()
        }
    }

    /// Returns every worker loop, or just the base loop when the pool has no
    /// workers.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        self.assert_in_base_thread();
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    /// Whether [`start`] ran.
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn started(&self) -> bool {
        self.started
    }

    /// The pool's name, the prefix of its worker thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn assert_in_base_thread(&self) {
        assert!(
            self.base.in_loop_thread(),
            "pool used from a thread other than its base loop's"
        );
    }
}

impl fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("thread_count", &self.thread_count)
            .finish_non_exhaustive()
    }
}
