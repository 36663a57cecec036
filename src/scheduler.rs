//! Scheduler instances.
//!
//! A [`Scheduler`] owns a set of named tasks, the per-thread subtask
//! queues, and the step lifecycle that drives them: assignments are built
//! while the instance is inactive, `next_step` publishes the schedule to
//! the pool through the global step counter, `run`/`parallel_for` publish
//! functors into tasks, and `wait` drains the main thread's queue and
//! blocks until the whole step has quiesced.
//!
//! The queue driver in this module also implements the coroutine protocol:
//! a paused subtask hands its thread to a pause target chosen from the
//! queue, and is resumed when the target completes or yields back.

use crate::range::{Range, Ratio};
use crate::reduction::{ReduceHandle, ReduceValue, TaskReduction};
use crate::runtime::runtime;
use crate::task::{SubTask, Task, TaskFunctor, TaskType};
use crate::trace;
use crate::worker;
use crate::{fiber, metrics};
use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Label of the singleton default schedule and its single loop task.
pub(crate) const DEFAULT_NAME: &str = "default";

/// One slot of a thread's execution queue.
#[derive(Clone)]
pub(crate) struct QueueEntry {
    pub task_id: usize,
    pub task: Arc<Task>,
    pub sub: Arc<SubTask>,
    /// For multi-loop subtasks, the basic task that owns the loop sequence.
    pub owner: Option<Arc<Task>>,
}

/// Assignment-time structure of a scheduler. Written only by the main
/// thread while the instance is inactive; snapshots taken at `next_step`
/// are what the execution paths read.
struct Plan {
    tasks: Vec<Arc<Task>>,
    labels: HashMap<String, usize>,
    queues: Vec<Vec<QueueEntry>>,
    snapshots: Vec<Arc<Vec<QueueEntry>>>,
}

impl Plan {
    fn new(nthreads: usize) -> Self {
        Plan {
            tasks: Vec::new(),
            labels: HashMap::new(),
            queues: vec![Vec::new(); nthreads],
            snapshots: vec![Arc::new(Vec::new()); nthreads],
        }
    }

    fn ensure_task(&mut self, label: &str, task_type: TaskType) -> usize {
        match self.labels.get(label) {
            Some(&id) => {
                assert_eq!(
                    self.tasks[id].task_type, task_type,
                    "task '{}': type may not change across assignments",
                    label
                );
                id
            }
            None => {
                let id = self.tasks.len();
                self.tasks.push(Arc::new(Task::new(label, task_type)));
                self.labels.insert(label.to_string(), id);
                id
            }
        }
    }

    /// Task id for a label that actually has subtasks this schedule.
    fn assigned(&self, label: &str) -> Option<usize> {
        self.labels
            .get(label)
            .copied()
            .filter(|&id| self.tasks[id].num_subtasks() > 0)
    }
}

/// Result of a pause-target search on a thread's queue.
enum TargetSearch {
    /// A target is ready to run at this queue position.
    Found(usize),
    /// The only incomplete candidates are ancestors on this thread's call
    /// stack; the caller should unwind so they can resume.
    YieldedToAncestor,
    /// Incomplete candidates exist but none is ready yet.
    Pending,
    /// Every candidate has completed (or there are none).
    None,
}

pub struct Scheduler {
    name: String,
    nthreads: usize,
    self_ref: Weak<Scheduler>,
    plan: RwLock<Plan>,
    active: AtomicBool,
    is_default: bool,
    /// Until the first `clear_assignments`, the instance forwards loops to
    /// the default schedule and runs functions synchronously.
    use_default: AtomicBool,
    /// Per-thread "system progressed" counters backing the `pause` fast
    /// path; bumped by every functor publication and checkpoint advance.
    progress: Vec<CachePadded<AtomicU32>>,
}

impl Scheduler {
    /// Creates a scheduler registered under `name` in the process-wide
    /// instance registry.
    pub fn new(name: &str) -> Arc<Scheduler> {
        let rt = runtime();
        assert!(
            name != DEFAULT_NAME,
            "'{}' is reserved for the default schedule",
            DEFAULT_NAME
        );
        let sched = Scheduler::with_threads(name, rt.num_threads(), false);
        rt.register_instance(name, &sched);
        sched
    }

    /// Looks up a registered scheduler by name.
    pub fn lookup(name: &str) -> Option<Arc<Scheduler>> {
        runtime().lookup_instance(name)
    }

    pub(crate) fn with_threads(name: &str, nthreads: usize, is_default: bool) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            nthreads,
            self_ref: weak.clone(),
            plan: RwLock::new(Plan::new(nthreads)),
            active: AtomicBool::new(false),
            is_default,
            use_default: AtomicBool::new(!is_default),
            progress: (0..nthreads)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
        })
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.self_ref.upgrade().expect("scheduler dropped while in use")
    }

    /// Builds the singleton default schedule: one loop task partitioned
    /// evenly over all threads.
    pub(crate) fn new_default(nthreads: usize) -> Arc<Scheduler> {
        let sched = Scheduler::with_threads(DEFAULT_NAME, nthreads, true);
        {
            let mut plan = sched.plan.write().unwrap();
            let id = plan.ensure_task(DEFAULT_NAME, TaskType::Loop);
            for tid in 0..nthreads {
                let range = Range::new(
                    Ratio::new(tid as i64, nthreads as i64),
                    Ratio::new(tid as i64 + 1, nthreads as i64),
                );
                let sub = Arc::new(SubTask::new(tid, range));
                plan.tasks[id].push_subtask(tid, Arc::clone(&sub));
                let task = Arc::clone(&plan.tasks[id]);
                plan.queues[tid].push(QueueEntry {
                    task_id: id,
                    task,
                    sub,
                    owner: None,
                });
            }
        }
        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ----- assignment -------------------------------------------------

    fn assert_mutable(&self) {
        assert!(
            !self.is_active(),
            "schedule '{}': assignments may not change while a step is active",
            self.name
        );
        assert_eq!(
            worker::thread_id(),
            0,
            "assignments must be made from the main thread"
        );
        assert!(!self.is_default, "the default schedule is fixed");
    }

    /// Drops all subtasks and queue entries, keeping the task objects (and
    /// their types) so labels stay stable. Also switches the instance from
    /// default-schedule forwarding to manual scheduling.
    pub fn clear_assignments(&self) {
        self.assert_mutable();
        self.use_default.store(false, Ordering::Release);
        let mut plan = self.plan.write().unwrap();
        for task in &plan.tasks {
            task.clear_subtasks();
        }
        for queue in &mut plan.queues {
            queue.clear();
        }
    }

    fn push_assignment(
        &self,
        plan: &mut Plan,
        task_id: usize,
        thread_id: usize,
        range: Range<Ratio>,
    ) {
        assert!(
            thread_id < self.nthreads,
            "thread id {} out of range (pool has {})",
            thread_id,
            self.nthreads
        );
        let sub = Arc::new(SubTask::new(thread_id, range));
        plan.tasks[task_id].push_subtask(thread_id, Arc::clone(&sub));
        let task = Arc::clone(&plan.tasks[task_id]);
        plan.queues[thread_id].push(QueueEntry {
            task_id,
            task,
            sub,
            owner: None,
        });
    }

    /// Assigns a basic (function) task to a thread. The order of `assign_*`
    /// calls for a thread is the order it executes subtasks within a step.
    pub fn assign_run(&self, label: &str, thread_id: usize) {
        self.assert_mutable();
        self.use_default.store(false, Ordering::Release);
        let mut plan = self.plan.write().unwrap();
        let id = plan.ensure_task(label, TaskType::Basic);
        self.push_assignment(&mut plan, id, thread_id, Range::full());
    }

    /// Assigns a basic task to `main_thread` together with a companion
    /// multi-loop task partitioned evenly over `threads`. Loops issued from
    /// inside the basic task's body execute on the companion.
    pub fn assign_run_group(&self, label: &str, main_thread: usize, threads: &[usize]) {
        self.assert_mutable();
        self.use_default.store(false, Ordering::Release);
        let mut plan = self.plan.write().unwrap();
        let basic_id = plan.ensure_task(label, TaskType::Basic);
        self.push_assignment(&mut plan, basic_id, main_thread, Range::full());
        if threads.is_empty() {
            return;
        }
        let companion_label = format!("{}_multiloop", label);
        let comp_id = plan.ensure_task(&companion_label, TaskType::MultiLoop);
        *plan.tasks[basic_id].companion.lock().unwrap() = Some(comp_id);
        *plan.tasks[comp_id].owner.lock().unwrap() = Some(basic_id);
        let n = threads.len() as i64;
        for (i, &tid) in threads.iter().enumerate() {
            let range = Range::new(Ratio::new(i as i64, n), Ratio::new(i as i64 + 1, n));
            self.push_assignment(&mut plan, comp_id, tid, range);
        }
    }

    /// Assigns a slice of a loop task to a thread. It is valid to assign
    /// several slices of the same loop to one thread; slices that tile
    /// `[0,1]` must be assigned somewhere or the loop will not complete.
    pub fn assign_loop(&self, label: &str, thread_id: usize, range: Range<Ratio>) {
        self.assert_mutable();
        self.use_default.store(false, Ordering::Release);
        assert!(
            range.start >= Ratio::ZERO && range.end <= Ratio::ONE && range.start <= range.end,
            "loop slice must lie inside [0,1]"
        );
        let mut plan = self.plan.write().unwrap();
        let id = plan.ensure_task(label, TaskType::Loop);
        self.push_assignment(&mut plan, id, thread_id, range);
    }

    /// Assigns a loop task partitioned evenly over `threads`.
    pub fn assign_loop_group(&self, label: &str, threads: &[usize]) {
        self.assert_mutable();
        self.use_default.store(false, Ordering::Release);
        let mut plan = self.plan.write().unwrap();
        let id = plan.ensure_task(label, TaskType::Loop);
        let n = threads.len() as i64;
        for (i, &tid) in threads.iter().enumerate() {
            let range = Range::new(Ratio::new(i as i64, n), Ratio::new(i as i64 + 1, n));
            self.push_assignment(&mut plan, id, tid, range);
        }
    }

    /// Re-slices an assigned loop task. `intervals` lists the cut points
    /// for the task's subtasks in assignment order and must start at 0 and
    /// end at 1.
    pub fn set_task_ranges(&self, label: &str, intervals: &[Ratio]) {
        self.assert_mutable();
        let plan = self.plan.read().unwrap();
        let id = plan.assigned(label).expect("set_task_ranges: unassigned task");
        let assign = plan.tasks[id].assign.lock().unwrap();
        assert_eq!(
            intervals.len(),
            assign.subtasks.len() + 1,
            "task '{}': need one interval bound per subtask plus one",
            label
        );
        assert_eq!(intervals[0], Ratio::ZERO);
        assert_eq!(*intervals.last().unwrap(), Ratio::ONE);
        for (i, sub) in assign.subtasks.iter().enumerate() {
            assert!(intervals[i] <= intervals[i + 1]);
            sub.set_range(Range::new(intervals[i], intervals[i + 1]));
        }
    }

    /// Marks a task as a coroutine on the given threads, with the named
    /// tasks as its pause targets.
    pub fn set_coroutine(&self, label: &str, threads: &[usize], continuations: &[&str]) {
        self.assert_mutable();
        let plan = self.plan.read().unwrap();
        let id = plan.assigned(label).expect("set_coroutine: unassigned task");
        plan.tasks[id].set_coroutine(threads, continuations);
    }

    /// Marks a task as a target for `yield_now`.
    pub fn set_high_priority(&self, label: &str) {
        self.assert_mutable();
        let plan = self.plan.read().unwrap();
        let id = plan
            .assigned(label)
            .expect("set_high_priority: unassigned task");
        plan.tasks[id].set_high_priority();
    }

    /// Enables runtime work stealing between the subtasks of a loop task.
    pub fn enable_task_auto_balancing(&self, label: &str) {
        self.assert_mutable();
        let plan = self.plan.read().unwrap();
        let id = plan
            .assigned(label)
            .expect("enable_task_auto_balancing: unassigned task");
        plan.tasks[id].enable_auto_balancing();
    }

    // ----- step lifecycle ---------------------------------------------

    /// Publishes a new step: restarts every task, precomputes coroutine
    /// pause targets, activates this instance and releases the pool via
    /// the step counter. A second call without an intervening `wait` is a
    /// no-op.
    pub fn next_step(&self) {
        assert_eq!(
            worker::thread_id(),
            0,
            "next_step must be called from the main thread"
        );
        if self.is_active() {
            return;
        }
        let rt = runtime();
        {
            let current = rt.current();
            assert!(
                !current.is_active() || std::ptr::eq(Arc::as_ptr(&current), self),
                "schedule '{}': cannot start a step while '{}' is active",
                self.name,
                current.name
            );
        }

        {
            let mut plan = self.plan.write().unwrap();
            for task in &plan.tasks {
                task.restart();
            }
            self.compute_pause_targets(&plan);
            // Rebuild the per-thread snapshots the execution paths read.
            let snapshots: Vec<_> = plan
                .queues
                .iter()
                .map(|q| {
                    let entries: Vec<QueueEntry> = q
                        .iter()
                        .map(|e| {
                            let owner = (*e.task.owner.lock().unwrap())
                                .map(|oid| Arc::clone(&plan.tasks[oid]));
                            QueueEntry {
                                owner,
                                ..e.clone()
                            }
                        })
                        .collect();
                    Arc::new(entries)
                })
                .collect();
            plan.snapshots = snapshots;
        }
        for p in &self.progress {
            p.store(0, Ordering::Relaxed);
        }

        metrics::on_step();
        self.active.store(true, Ordering::Release);
        rt.set_current(&self.arc());
        rt.begin_step();
        log::trace!("schedule '{}': step {}", self.name, rt.load_step_counter());
    }

    fn compute_pause_targets(&self, plan: &Plan) {
        for (tid, queue) in plan.queues.iter().enumerate() {
            for (pos, entry) in queue.iter().enumerate() {
                let mut candidates = Vec::new();
                if entry.task.is_coroutine_for(tid) {
                    let next = entry.task.coroutine.lock().unwrap().next_tasks.clone();
                    for (j, other) in queue.iter().enumerate() {
                        if j != pos && next.contains(&other.task.label) {
                            candidates.push(j);
                        }
                    }
                }
                *entry.sub.candidates.lock().unwrap() = candidates;
            }
        }
    }

    /// Publishes a function task's functor for this step. Unassigned
    /// labels (and instances still on the default schedule) execute the
    /// function synchronously instead.
    pub fn run<F>(&self, label: &str, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_default || self.use_default.load(Ordering::Acquire) {
            f();
            return;
        }
        let task = {
            let plan = self.plan.read().unwrap();
            plan.assigned(label).map(|id| Arc::clone(&plan.tasks[id]))
        };
        match task {
            None => f(),
            Some(task) => {
                assert_eq!(
                    task.task_type,
                    TaskType::Basic,
                    "run() on non-basic task '{}'",
                    label
                );
                task.set_functor(TaskFunctor::basic(f));
                self.mark_state_change();
            }
        }
    }

    /// Executes a parallel loop over `[start, end)`.
    pub fn parallel_for<F>(&self, label: &str, start: i64, end: i64, body: F)
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.parallel_for_impl(label, start, end, Box::new(body), None);
    }

    /// Executes a parallel loop with a reduction. Loop bodies contribute
    /// through [`Scheduler::collect`]; the merged result is available from
    /// the reduction once this returns.
    pub fn parallel_for_reduce<T, F>(
        &self,
        label: &str,
        start: i64,
        end: i64,
        body: F,
        reduction: &Arc<TaskReduction<T>>,
    ) where
        T: ReduceValue,
        F: Fn(i64) + Send + Sync + 'static,
    {
        let handle: Arc<dyn ReduceHandle> = Arc::clone(reduction) as Arc<dyn ReduceHandle>;
        self.parallel_for_impl(label, start, end, Box::new(body), Some(handle));
    }

    fn parallel_for_impl(
        &self,
        label: &str,
        start: i64,
        end: i64,
        body: Box<dyn Fn(i64) + Send + Sync>,
        reduction: Option<Arc<dyn ReduceHandle>>,
    ) {
        assert!(start <= end, "parallel_for: negative range");
        if self.is_default {
            return self.default_parallel_for(start, end, body, reduction);
        }
        if self.use_default.load(Ordering::Acquire) {
            return runtime()
                .default_instance()
                .default_parallel_for(start, end, body, reduction);
        }

        let tid = worker::thread_id();
        let task = {
            let plan = self.plan.read().unwrap();
            let id = plan.assigned(label).or_else(|| {
                // A loop issued inside a grouped run task lands on the
                // task's companion multi-loop.
                worker::current_task()
                    .and_then(|t| *t.companion.lock().unwrap())
                    .filter(|&cid| plan.tasks[cid].num_subtasks() > 0)
            });
            id.map(|id| (id, Arc::clone(&plan.tasks[id])))
        };
        let Some((task_id, task)) = task else {
            // Unassigned: run the loop in place on the caller.
            for i in start..end {
                body(i);
            }
            if let Some(r) = reduction {
                r.reduce();
            }
            return;
        };

        match task.task_type {
            TaskType::Basic => panic!("parallel_for on basic task '{}'", task.label),
            TaskType::Loop => {
                task.set_reduction(reduction.clone());
                task.set_functor(TaskFunctor::Loop {
                    body,
                    range: Range::new(start, end),
                });
                self.mark_state_change();
                self.nested_loop_run(tid, task_id);
                task.wait();
                if let Some(r) = reduction {
                    r.reduce();
                }
            }
            TaskType::MultiLoop => {
                // One round: re-arm the end barrier, publish, run the
                // caller's slice, wait for the group.
                task.end.close(task.num_subtasks() as i32);
                task.set_reduction(reduction.clone());
                task.publish_round(TaskFunctor::Loop {
                    body,
                    range: Range::new(start, end),
                });
                self.mark_state_change();
                let queue = self.thread_queue(tid);
                if let Some(pos) = queue.iter().position(|e| e.task_id == task_id) {
                    let entry = &queue[pos];
                    worker::push_frame(pos, Arc::clone(&entry.task), Arc::clone(&entry.sub));
                    entry.task.run(entry.sub.range(), &entry.sub);
                    worker::pop_frame();
                    entry.sub.rounds_done.fetch_add(1, Ordering::Release);
                }
                task.wait();
                if let Some(r) = reduction {
                    r.reduce();
                }
            }
        }
    }

    /// The default schedule wraps each loop in an implicit one-task step.
    fn default_parallel_for(
        &self,
        start: i64,
        end: i64,
        body: Box<dyn Fn(i64) + Send + Sync>,
        reduction: Option<Arc<dyn ReduceHandle>>,
    ) {
        assert_eq!(
            worker::thread_id(),
            0,
            "default-schedule parallel_for must run on the main thread"
        );
        assert!(
            !self.is_active(),
            "default-schedule parallel_for cannot nest"
        );
        let rt = runtime();
        let default = rt.default_instance();
        default.next_step();
        let (task_id, task) = {
            let plan = default.plan.read().unwrap();
            let id = plan.assigned(DEFAULT_NAME).expect("default task missing");
            (id, Arc::clone(&plan.tasks[id]))
        };
        task.set_reduction(reduction.clone());
        task.set_functor(TaskFunctor::Loop {
            body,
            range: Range::new(start, end),
        });
        default.mark_state_change();
        default.nested_loop_run(0, task_id);
        task.wait();
        if let Some(r) = reduction {
            r.reduce();
        }
        rt.wait_step_complete();
        default.active.store(false, Ordering::Release);
    }

    /// Publishes an empty function so the assigned thread still marks the
    /// task's barriers and advances. Equivalent to a `run` that does
    /// nothing.
    pub fn skip_run(&self, label: &str) {
        self.run(label, || {});
    }

    /// Publishes an empty loop for this step.
    pub fn skip_loop(&self, label: &str) {
        if self.is_default || self.use_default.load(Ordering::Acquire) {
            return;
        }
        let task = {
            let plan = self.plan.read().unwrap();
            plan.assigned(label).map(|id| Arc::clone(&plan.tasks[id]))
        };
        if let Some(task) = task {
            assert_eq!(
                task.task_type,
                TaskType::Loop,
                "skip_loop on non-loop task '{}'",
                label
            );
            task.set_functor(TaskFunctor::skip_loop());
            self.mark_state_change();
        }
    }

    /// Blocks until the named task's end barrier fires. A no-op for
    /// unassigned labels.
    pub fn wait_for_task(&self, label: &str) {
        if self.is_default || self.use_default.load(Ordering::Acquire) {
            return;
        }
        let task = {
            let plan = self.plan.read().unwrap();
            plan.assigned(label).map(|id| Arc::clone(&plan.tasks[id]))
        };
        if let Some(task) = task {
            task.wait();
        }
    }

    /// Drains the main thread's queue, waits for every task's end barrier
    /// and the step-completion barrier, then deactivates the instance.
    pub fn wait(&self) {
        if !self.is_active() {
            return;
        }
        assert_eq!(
            worker::thread_id(),
            0,
            "wait() must be called from the main thread"
        );
        self.process_queue(0);
        let tasks: Vec<Arc<Task>> = self.plan.read().unwrap().tasks.clone();
        for task in &tasks {
            if task.num_subtasks() > 0 {
                task.wait();
            }
        }
        let rt = runtime();
        rt.wait_step_complete();
        self.active.store(false, Ordering::Release);
        rt.set_current(&rt.default_instance());
        log::trace!("schedule '{}': step complete", self.name);
    }

    /// Hook for automatic schedule computation from the previous step's
    /// timing data. Not implemented; a policy module may override the
    /// assignments through the public API instead.
    pub fn reschedule(&self) {}

    // ----- queue driver -----------------------------------------------

    pub(crate) fn thread_queue(&self, tid: usize) -> Arc<Vec<QueueEntry>> {
        Arc::clone(&self.plan.read().unwrap().snapshots[tid])
    }

    /// Runs this thread's whole queue for the current step.
    pub(crate) fn process_queue(&self, tid: usize) {
        let queue = self.thread_queue(tid);
        loop {
            let mut ran_any = false;
            for pos in 0..queue.len() {
                if !queue[pos].sub.is_done() {
                    ran_any = true;
                    self.run_subtask(&queue, pos);
                }
            }
            if queue.iter().all(|e| e.sub.is_done()) {
                break;
            }
            if !ran_any {
                std::hint::spin_loop();
            }
        }
    }

    /// Drives the subtask at `pos` to completion, interleaving pause
    /// targets whenever it suspends. Returns early (leaving the subtask
    /// suspended) only when the subtask yielded to an ancestor on this
    /// thread's call stack.
    fn run_subtask(&self, queue: &[QueueEntry], pos: usize) {
        let entry = &queue[pos];
        if entry.sub.is_done() {
            return;
        }
        if entry.task.task_type == TaskType::MultiLoop {
            return self.run_multiloop_subtask(queue, pos);
        }
        worker::push_frame(pos, Arc::clone(&entry.task), Arc::clone(&entry.sub));
        loop {
            if entry.task.checkpoint() >= entry.sub.resume_checkpoint() {
                if self.run_once(&entry.task, &entry.sub) {
                    break;
                }
                // Paused voluntarily: hand the thread to a target before
                // resuming.
                match self.find_pause_target(queue, pos) {
                    TargetSearch::Found(j) => self.run_subtask(queue, j),
                    TargetSearch::YieldedToAncestor => {
                        worker::pop_frame();
                        return;
                    }
                    TargetSearch::Pending => std::hint::spin_loop(),
                    TargetSearch::None => {}
                }
            } else {
                // Not resumable yet; keep targets moving while the
                // checkpoint catches up on another thread.
                match self.find_pause_target(queue, pos) {
                    TargetSearch::Found(j) => self.run_subtask(queue, j),
                    TargetSearch::YieldedToAncestor => {
                        worker::pop_frame();
                        return;
                    }
                    TargetSearch::Pending | TargetSearch::None => std::hint::spin_loop(),
                }
            }
        }
        worker::pop_frame();
        self.finish_subtask(queue, pos);
        // Completed: keep driving targets that are ready now.
        while let TargetSearch::Found(j) = self.find_pause_target(queue, pos) {
            self.run_subtask(queue, j);
        }
    }

    /// Executes one resume of a subtask. Returns whether it completed.
    fn run_once(&self, task: &Arc<Task>, sub: &Arc<SubTask>) -> bool {
        let tid = sub.thread_id;
        if !task.is_coroutine_for(tid) {
            task.run(sub.range(), sub);
            self.finish_balance(task, sub);
            sub.set_done();
            return true;
        }

        let attached = sub.runner.lock().unwrap().take();
        let mut runner = match attached {
            Some(runner) => {
                sub.times.lock().unwrap().begin_run(trace::now_micros());
                runner
            }
            None => {
                let mut runner = runtime().fiber_pool().get(tid);
                let task_c = Arc::clone(task);
                let sub_c = Arc::clone(sub);
                runner.run(move || task_c.run(sub_c.range(), &sub_c));
                runner
            }
        };
        if runner.cont() {
            runtime().fiber_pool().release(tid, runner);
            self.finish_balance(task, sub);
            sub.set_done();
            true
        } else {
            metrics::on_fiber_pause();
            sub.times.lock().unwrap().end_run(trace::now_micros());
            *sub.runner.lock().unwrap() = Some(runner);
            false
        }
    }

    /// After a subtask's own slice is done, pull stolen tails while the
    /// task has imbalanced work left.
    fn finish_balance(&self, task: &Arc<Task>, sub: &Arc<SubTask>) {
        while let Some(stolen) = task.steal_work(sub) {
            metrics::on_steal();
            task.run_stolen(stolen, sub);
        }
    }

    /// Driver for a multi-loop subtask: consume loop rounds as the owning
    /// task publishes them, until the owner completes.
    fn run_multiloop_subtask(&self, queue: &[QueueEntry], pos: usize) {
        let entry = &queue[pos];
        let owner = entry
            .owner
            .clone()
            .expect("multi-loop task without an owning task");
        worker::push_frame(pos, Arc::clone(&entry.task), Arc::clone(&entry.sub));
        loop {
            let published = entry.task.rounds.load(Ordering::Acquire);
            let consumed = entry.sub.rounds_done.load(Ordering::Acquire);
            if consumed < published {
                entry.task.run(entry.sub.range(), &entry.sub);
                entry.sub.rounds_done.store(consumed + 1, Ordering::Release);
                continue;
            }
            if owner.is_complete() && entry.task.rounds.load(Ordering::Acquire) == consumed {
                break;
            }
            std::hint::spin_loop();
        }
        worker::pop_frame();
        entry.sub.set_done();
        self.finish_subtask(queue, pos);
    }

    fn finish_subtask(&self, queue: &[QueueEntry], pos: usize) {
        metrics::on_subtask();
        if pos > 0 {
            let avail = queue[pos].task.functor_set_time_us();
            if avail != 0 {
                queue[pos - 1].sub.times.lock().unwrap().next_run_avail_us = Some(avail);
            }
        }
    }

    /// Advances the caller's queue up to and through its next subtask of
    /// `target`, running intermediate subtasks (which must have been
    /// skip-published) along the way.
    fn nested_loop_run(&self, tid: usize, target: usize) {
        let queue = self.thread_queue(tid);
        let mut pos = worker::stack_top().map(|(p, _, _)| p + 1).unwrap_or(0);
        loop {
            assert!(
                pos < queue.len(),
                "parallel_for: thread {} has no remaining subtask for the target task",
                tid
            );
            let entry = &queue[pos];
            if entry.sub.is_done() {
                pos += 1;
                continue;
            }
            let is_target = entry.task_id == target;
            self.run_subtask(&queue, pos);
            if is_target {
                break;
            }
            pos += 1;
        }
    }

    fn find_pause_target(&self, queue: &[QueueEntry], pos: usize) -> TargetSearch {
        let candidates = queue[pos].sub.candidates.lock().unwrap().clone();
        let mut any_incomplete = false;
        let mut any_on_stack = false;
        for &j in &candidates {
            let entry = &queue[j];
            if entry.sub.is_done() {
                continue;
            }
            any_incomplete = true;
            if worker::on_stack(j) {
                any_on_stack = true;
                continue;
            }
            if !self.subtask_ready(entry) {
                continue;
            }
            if entry.task.checkpoint() < entry.sub.resume_checkpoint() {
                continue;
            }
            return TargetSearch::Found(j);
        }
        if any_on_stack {
            TargetSearch::YieldedToAncestor
        } else if any_incomplete {
            TargetSearch::Pending
        } else {
            TargetSearch::None
        }
    }

    /// Whether a queue entry could make progress if run right now.
    fn subtask_ready(&self, entry: &QueueEntry) -> bool {
        match entry.task.task_type {
            TaskType::MultiLoop => {
                let published = entry.task.rounds.load(Ordering::Acquire);
                let consumed = entry.sub.rounds_done.load(Ordering::Acquire);
                published > consumed
                    || entry.owner.as_ref().map(|o| o.is_complete()).unwrap_or(false)
            }
            _ => entry.task.is_ready(),
        }
    }

    // ----- coroutine / pause / yield ----------------------------------

    /// Bumps every thread's progress counter; called whenever a functor is
    /// published or a checkpoint advances so `pause` polling stays cheap.
    fn mark_state_change(&self) {
        for p in &self.progress {
            p.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Suspension point for coroutine tasks; equivalent to `pause_at(0)`.
    pub fn pause(&self) -> bool {
        self.pause_at(0)
    }

    /// Suspends the current subtask if a pause target exists on this
    /// thread's queue, or if the task's checkpoint has not reached `cp`.
    /// Returns `true` after the subtask has been resumed, `false` if there
    /// was no reason to suspend. Cheap to poll from inner loops: when
    /// nothing has been published since the last failed attempt the fast
    /// path returns without looking at the queue.
    pub fn pause_at(&self, cp: i64) -> bool {
        let tid = worker::thread_id();
        if cp == 0 && self.progress[tid].load(Ordering::Relaxed) == 0 {
            return false;
        }
        let Some((pos, task, sub)) = worker::stack_top() else {
            return false;
        };
        if !task.is_coroutine_for(tid) || !fiber::in_fiber() {
            return false;
        }
        let queue = self.thread_queue(tid);
        let target_exists = !matches!(self.find_pause_target(&queue, pos), TargetSearch::None);
        if !target_exists && task.checkpoint() >= cp {
            self.progress[tid].store(0, Ordering::Relaxed);
            return false;
        }
        sub.set_resume_checkpoint(cp);
        fiber::suspend();
        true
    }

    /// Cooperative yield for non-coroutine tasks: if a high-priority task
    /// later on this thread's queue is ready, run it to completion now.
    pub fn yield_now(&self) {
        let Some((pos, _, _)) = worker::stack_top() else {
            return;
        };
        let tid = worker::thread_id();
        let queue = self.thread_queue(tid);
        for j in pos + 1..queue.len() {
            let entry = &queue[j];
            if entry.sub.is_done()
                || !entry.task.is_high_priority()
                || !entry.task.is_ready()
                || worker::on_stack(j)
            {
                continue;
            }
            metrics::on_yield();
            self.run_subtask(&queue, j);
            return;
        }
    }

    /// Advances the current task's checkpoint, releasing subtasks paused
    /// with a matching `pause_at`.
    pub fn set_checkpoint(&self, cp: i64) {
        let task = worker::current_task().expect("set_checkpoint outside any task");
        task.advance_checkpoint(cp);
        self.mark_state_change();
    }

    /// Blocks until the current task's checkpoint reaches `cp`.
    pub fn wait_for_checkpoint(&self, cp: i64) {
        let task = worker::current_task().expect("wait_for_checkpoint outside any task");
        while task.checkpoint() < cp {
            std::hint::spin_loop();
        }
    }

    // ----- reductions -------------------------------------------------

    /// Allocates a reduction for an assigned task: one slot per
    /// participating thread, all starting from `init`.
    pub fn create_task_reduction<T: ReduceValue>(
        &self,
        label: &str,
        init: T,
    ) -> Arc<TaskReduction<T>> {
        let slots = self.get_task_num_threads(label).max(1);
        Arc::new(TaskReduction::new(init, slots))
    }

    /// Adds `value` to the calling thread's slot of the current task's
    /// reduction. Silently ignored outside any task.
    pub fn collect<T: ReduceValue>(&self, value: T) {
        let Some(task) = worker::current_task() else {
            log::debug!("collect() outside any task; value dropped");
            return;
        };
        let Some(handle) = task.reduction() else {
            return;
        };
        let reduction = handle
            .as_any()
            .downcast_ref::<TaskReduction<T>>()
            .expect("collect(): value type does not match the task reduction");
        let Some(slot) = task.thread_task_id(worker::thread_id()) else {
            return;
        };
        debug_assert!(slot < reduction.num_slots());
        reduction.collect(value, slot);
    }

    /// Appends a user-labelled timestamp to the current subtask's record.
    pub fn record_time(&self, label: &str) {
        if let Some((_, _, sub)) = worker::stack_top() {
            sub.record_time(label);
        }
    }

    // ----- introspection ----------------------------------------------

    pub fn get_num_threads(&self) -> usize {
        self.nthreads
    }

    pub fn get_num_subtasks(&self, thread_id: usize) -> usize {
        self.plan.read().unwrap().queues[thread_id].len()
    }

    pub fn get_task_num_threads(&self, label: &str) -> usize {
        let plan = self.plan.read().unwrap();
        plan.assigned(label)
            .map(|id| plan.tasks[id].num_threads())
            .unwrap_or(0)
    }

    /// Task-local id of the calling thread within its current task, or
    /// `None` when no subtask is running on this thread.
    pub fn get_task_thread_id(&self) -> Option<usize> {
        worker::current_task().and_then(|t| t.thread_task_id(worker::thread_id()))
    }

    /// Dumps the per-thread queues to stderr.
    pub fn print_assignments(&self) {
        let plan = self.plan.read().unwrap();
        eprintln!("schedule '{}':", self.name);
        for (tid, queue) in plan.queues.iter().enumerate() {
            let items: Vec<String> = queue
                .iter()
                .map(|e| {
                    let r = e.sub.range();
                    format!("{}[{},{})", e.task.label, r.start, r.end)
                })
                .collect();
            eprintln!("  thread {:>2}: {}", tid, items.join("  "));
        }
    }

    /// Timing records of one task's subtasks for the last step, in
    /// assignment order. Empty for unassigned labels.
    pub fn subtask_times(&self, label: &str) -> Vec<crate::task::SubTaskTimes> {
        let plan = self.plan.read().unwrap();
        match plan.assigned(label) {
            Some(id) => {
                let assign = plan.tasks[id].assign.lock().unwrap();
                assign
                    .subtasks
                    .iter()
                    .map(|s| s.times.lock().unwrap().clone())
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Dumps the last step's timing for one task to stderr.
    pub fn print_subtask_times(&self, label: &str) {
        let plan = self.plan.read().unwrap();
        let Some(id) = plan.assigned(label) else {
            eprintln!("task '{}': not assigned", label);
            return;
        };
        let assign = plan.tasks[id].assign.lock().unwrap();
        eprintln!("task '{}':", label);
        for sub in assign.subtasks.iter() {
            let times = sub.times.lock().unwrap();
            eprintln!(
                "  thread {:>2}: wait {:>8}us run {:>8}us resumes {} next-avail {:?}",
                sub.thread_id,
                times.wait_duration_us(),
                times.run_duration_us(),
                times.runs.len(),
                times.next_run_avail_us,
            );
            for (aux, stamps) in times.aux.iter() {
                eprintln!("    {}: {} samples", aux, stamps.len());
            }
        }
    }
}
