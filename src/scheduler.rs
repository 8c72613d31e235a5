//! Dependency-aware parallel build scheduling.
//!
//! A pool of worker threads draws ready sources from the graph. Two
//! locks coordinate everything: the queue lock protects the scheduling
//! sets and readiness computation, the APT lock serializes mutations of
//! the shared package directory and its index. No source starts until
//! every transitive build-time dependency is built; the first failure
//! stops all further dispatch.

use crate::builder::{update_apt_index, BuildContext, BuildRunner};
use crate::error::Error;
use crate::graph::PackageGraph;
use crate::logs::BuildLog;
use crate::paths::Layout;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How long a worker blocks on the queue before recomputing readiness.
const QUEUE_WAIT: Duration = Duration::from_secs(5);

struct State {
    /// Scheduled sources not yet queued, running or built.
    to_build: BTreeSet<usize>,
    /// Members of `to_build` already emitted as ready.
    queued: BTreeSet<usize>,
    /// Dispatch queue, in `(batch_priority, name)` order per refresh.
    queue: VecDeque<usize>,
    in_progress: BTreeSet<usize>,
    built: BTreeSet<usize>,
    failed: Vec<(usize, Error)>,
}

/// The worker pool.
pub struct Scheduler<'a> {
    graph: &'a PackageGraph,
    runner: &'a dyn BuildRunner,
    layout: &'a Layout,
    parallel: usize,
    /// Snapshot of everything scheduled this run; dependencies outside
    /// it are considered satisfied.
    scheduled: BTreeSet<usize>,
}

impl<'a> Scheduler<'a> {
    /// Create a scheduler over `graph` sized to `parallel` workers.
    pub fn new(
        graph: &'a PackageGraph,
        runner: &'a dyn BuildRunner,
        layout: &'a Layout,
        parallel: usize,
    ) -> Scheduler<'a> {
        let scheduled = graph.to_build();
        Scheduler {
            graph,
            runner,
            layout,
            parallel: std::cmp::max(1, std::cmp::min(parallel, scheduled.len())),
            scheduled,
        }
    }

    /// Names of the sources this run will build.
    pub fn to_build_names(&self) -> Vec<String> {
        let mut names: Vec<usize> = self.scheduled.iter().copied().collect();
        self.graph.dispatch_order(&mut names);
        names
            .into_iter()
            .map(|i| self.graph.node(i).pkg.name.clone())
            .collect()
    }

    fn refresh_ready(&self, state: &mut State) {
        let mut ready: Vec<usize> = Vec::new();
        for &idx in &state.to_build {
            if state.queued.contains(&idx) {
                continue;
            }
            let satisfied = self.graph.node(idx).build_time_deps.iter().all(|dep| {
                state.built.contains(dep) || !self.scheduled.contains(dep)
            });
            if satisfied {
                ready.push(idx);
            }
        }
        self.graph.dispatch_order(&mut ready);
        for idx in ready {
            state.queued.insert(idx);
            state.queue.push_back(idx);
        }
    }

    fn worker(&self, state: &Mutex<State>, cond: &Condvar, apt_lock: &Mutex<()>) {
        loop {
            let idx = {
                let mut st = state.lock().unwrap();
                loop {
                    if !st.failed.is_empty() {
                        return;
                    }
                    if st.to_build.is_empty() && st.queue.is_empty() {
                        return;
                    }
                    if let Some(idx) = st.queue.pop_front() {
                        st.to_build.remove(&idx);
                        st.queued.remove(&idx);
                        st.in_progress.insert(idx);
                        break idx;
                    }
                    let (guard, timeout) = cond.wait_timeout(st, QUEUE_WAIT).unwrap();
                    st = guard;
                    if timeout.timed_out() {
                        self.refresh_ready(&mut st);
                    }
                }
            };

            let pkg = &self.graph.node(idx).pkg;
            let log_path = self.layout.pkg_log_path(&pkg.name);
            log::info!("Building package [{}] ({})", pkg.name, log_path.display());
            let result = match BuildLog::to_file(&log_path) {
                Ok(log) => {
                    let ctx = BuildContext {
                        log: &log,
                        apt_lock,
                    };
                    self.runner.build(pkg, &ctx).and_then(|()| {
                        let _apt = apt_lock.lock().unwrap();
                        update_apt_index(self.layout, &log)
                    })
                }
                Err(e) => Err(e.into()),
            };

            let mut st = state.lock().unwrap();
            st.in_progress.remove(&idx);
            match result {
                Ok(()) => {
                    log::info!("Built package [{}]", pkg.name);
                    st.built.insert(idx);
                    self.refresh_ready(&mut st);
                    cond.notify_all();
                }
                Err(e) => {
                    log::error!("Failed to build package [{}]: {}", pkg.name, e);
                    st.failed.push((idx, e));
                    cond.notify_all();
                    return;
                }
            }
        }
    }

    /// Run every scheduled build to completion or first failure.
    pub fn run(&self) -> Result<(), Error> {
        if self.scheduled.is_empty() {
            log::info!("Nothing to build");
            return Ok(());
        }

        let state = Mutex::new(State {
            to_build: self.scheduled.clone(),
            queued: BTreeSet::new(),
            queue: VecDeque::new(),
            in_progress: BTreeSet::new(),
            built: BTreeSet::new(),
            failed: Vec::new(),
        });
        let cond = Condvar::new();
        let apt_lock = Mutex::new(());

        self.refresh_ready(&mut state.lock().unwrap());

        std::thread::scope(|scope| {
            for _ in 0..self.parallel {
                scope.spawn(|| self.worker(&state, &cond, &apt_lock));
            }
        });

        let st = state.into_inner().unwrap();
        if st.failed.is_empty() {
            return Ok(());
        }
        for (idx, error) in &st.failed {
            log::error!(
                "{}: {}",
                self.graph.node(*idx).pkg.name,
                error
            );
        }
        let names = st
            .failed
            .iter()
            .map(|(idx, _)| format!("{:?}", self.graph.node(*idx).pkg.name))
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::Call(format!("{} Packages failed to build", names)))
    }
}
