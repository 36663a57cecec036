//! Tasks and subtasks.
//!
//! A [`Task`] is a named unit of work published once per step: its functor
//! slot, begin/end barriers, checkpoint counter, coroutine configuration
//! and (optional) reduction live here. A [`SubTask`] is one thread's slice
//! of one task: its rational range, done flag, resume checkpoint, fiber
//! runner slot and per-run timing.
//!
//! The functor slot is an atomic pointer published with release ordering
//! and read behind the begin barrier's acquire wait; that single edge is
//! what makes the slot safe to read lock-free during a step.

use crate::barrier::{MOBarrier, OMBarrier};
use crate::fiber::FiberRunner;
use crate::range::{Range, Ratio};
use crate::reduction::ReduceHandle;
use crate::trace;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Minimum remaining iterations a victim must have before its tail can be
/// stolen.
const STEAL_THRESHOLD: i64 = 2;

/// The callable published into a task's slot each step.
pub(crate) enum TaskFunctor {
    Basic(Box<dyn Fn() + Send + Sync>),
    Loop {
        body: Box<dyn Fn(i64) + Send + Sync>,
        range: Range<i64>,
    },
}

impl TaskFunctor {
    pub(crate) fn basic<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        TaskFunctor::Basic(Box::new(f))
    }

    pub(crate) fn loop_over<F>(body: F, range: Range<i64>) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        TaskFunctor::Loop {
            body: Box::new(body),
            range,
        }
    }

    /// An empty functor; assigned threads still mark the barriers and
    /// advance their queues.
    pub(crate) fn skip_loop() -> Self {
        TaskFunctor::loop_over(|_| {}, Range::new(0, 0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskType {
    Basic,
    Loop,
    MultiLoop,
}

/// Iteration bookkeeping for one subtask while auto-balancing is active.
#[derive(Default)]
pub(crate) struct RunInfo {
    pub next: i64,
    pub end: i64,
    pub active: bool,
}

/// One contiguous execution interval of a subtask, in microseconds against
/// the global epoch. Coroutine subtasks accumulate one span per resume.
#[derive(Clone, Copy, Debug)]
pub struct RunSpan {
    pub start_us: u64,
    pub end_us: Option<u64>,
}

/// Timing record of one subtask for the current step.
#[derive(Clone, Default)]
pub struct SubTaskTimes {
    pub wait_start_us: Option<u64>,
    pub runs: Vec<RunSpan>,
    pub next_run_avail_us: Option<u64>,
    pub aux: HashMap<String, Vec<u64>>,
}

impl SubTaskTimes {
    fn clear(&mut self) {
        *self = SubTaskTimes::default();
    }

    pub(crate) fn begin_run(&mut self, t: u64) {
        self.runs.push(RunSpan {
            start_us: t,
            end_us: None,
        });
    }

    pub(crate) fn end_run(&mut self, t: u64) {
        if let Some(span) = self.runs.last_mut() {
            if span.end_us.is_none() {
                span.end_us = Some(t);
            }
        }
    }

    /// Total time spent executing, summed over run spans.
    pub fn run_duration_us(&self) -> u64 {
        self.runs
            .iter()
            .filter_map(|s| s.end_us.map(|e| e.saturating_sub(s.start_us)))
            .sum()
    }

    pub fn wait_duration_us(&self) -> u64 {
        match (self.wait_start_us, self.runs.first()) {
            (Some(w), Some(first)) => first.start_us.saturating_sub(w),
            _ => 0,
        }
    }
}

/// One thread's slice of one task.
pub(crate) struct SubTask {
    pub thread_id: usize,
    range: Mutex<Range<Ratio>>,
    done: AtomicBool,
    resume_checkpoint: AtomicI64,
    /// Multi-loop rounds this subtask has executed this step.
    pub rounds_done: AtomicI64,
    pub runner: Mutex<Option<FiberRunner>>,
    pub run_info: Mutex<RunInfo>,
    pub times: Mutex<SubTaskTimes>,
    /// Queue positions on the owning thread that are pause targets for this
    /// subtask; rebuilt by `next_step`.
    pub candidates: Mutex<Vec<usize>>,
}

impl SubTask {
    pub(crate) fn new(thread_id: usize, range: Range<Ratio>) -> Self {
        SubTask {
            thread_id,
            range: Mutex::new(range),
            done: AtomicBool::new(false),
            resume_checkpoint: AtomicI64::new(0),
            rounds_done: AtomicI64::new(0),
            runner: Mutex::new(None),
            run_info: Mutex::new(RunInfo::default()),
            times: Mutex::new(SubTaskTimes::default()),
            candidates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn range(&self) -> Range<Ratio> {
        *self.range.lock().unwrap()
    }

    pub(crate) fn set_range(&self, r: Range<Ratio>) {
        *self.range.lock().unwrap() = r;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn resume_checkpoint(&self) -> i64 {
        self.resume_checkpoint.load(Ordering::Acquire)
    }

    pub(crate) fn set_resume_checkpoint(&self, cp: i64) {
        self.resume_checkpoint.store(cp, Ordering::Release);
    }

    pub(crate) fn record_time(&self, label: &str) {
        let mut times = self.times.lock().unwrap();
        times
            .aux
            .entry(label.to_string())
            .or_default()
            .push(trace::now_micros());
    }

    /// Per-step reset, called from `Task::restart`.
    fn reset(&self) {
        self.done.store(false, Ordering::Release);
        self.resume_checkpoint.store(0, Ordering::Release);
        self.rounds_done.store(0, Ordering::Release);
        self.times.lock().unwrap().clear();
        *self.run_info.lock().unwrap() = RunInfo::default();
        // A runner left over from the previous step means the schedule was
        // abandoned mid-coroutine; dropping it unwinds the fiber.
        let stale = self.runner.lock().unwrap().take();
        drop(stale);
    }
}

/// Assignment-time state of a task: its subtasks and the mapping from STS
/// thread id to task-local thread id. Written only while the owning
/// scheduler is inactive.
#[derive(Default)]
pub(crate) struct TaskAssign {
    pub subtasks: Vec<Arc<SubTask>>,
    pub thread_task_ids: HashMap<usize, usize>,
}

/// Coroutine configuration of a task.
#[derive(Default)]
pub(crate) struct CoroutineCfg {
    pub threads: HashSet<usize>,
    pub next_tasks: HashSet<String>,
}

pub(crate) struct Task {
    pub label: String,
    pub task_type: TaskType,
    functor: AtomicPtr<TaskFunctor>,
    functor_set_us: AtomicU64,
    pub begin: MOBarrier,
    pub end: OMBarrier,
    checkpoint: AtomicI64,
    /// Functors published this step; only advances for multi-loop tasks.
    pub rounds: AtomicI64,
    pub assign: Mutex<TaskAssign>,
    pub coroutine: Mutex<CoroutineCfg>,
    reduction: RwLock<Option<Arc<dyn ReduceHandle>>>,
    high_priority: AtomicBool,
    auto_balance: AtomicBool,
    balance_lock: Mutex<()>,
    /// Basic task -> id of its companion multi-loop task.
    pub companion: Mutex<Option<usize>>,
    /// Multi-loop task -> id of the basic task that owns it.
    pub owner: Mutex<Option<usize>>,
}

impl Task {
    pub(crate) fn new(label: &str, task_type: TaskType) -> Self {
        Task {
            label: label.to_string(),
            task_type,
            functor: AtomicPtr::new(std::ptr::null_mut()),
            functor_set_us: AtomicU64::new(0),
            begin: MOBarrier::new(),
            end: OMBarrier::new(),
            checkpoint: AtomicI64::new(0),
            rounds: AtomicI64::new(0),
            assign: Mutex::new(TaskAssign::default()),
            coroutine: Mutex::new(CoroutineCfg::default()),
            reduction: RwLock::new(None),
            high_priority: AtomicBool::new(false),
            auto_balance: AtomicBool::new(false),
            balance_lock: Mutex::new(()),
            companion: Mutex::new(None),
            owner: Mutex::new(None),
        }
    }

    /// Appends a subtask and hands its thread a task-local id on first
    /// occurrence. Task-local ids are contiguous from 0 and stable until
    /// the assignments are cleared.
    pub(crate) fn push_subtask(&self, thread_id: usize, sub: Arc<SubTask>) {
        let mut assign = self.assign.lock().unwrap();
        let next_id = assign.thread_task_ids.len();
        assign.thread_task_ids.entry(thread_id).or_insert(next_id);
        assign.subtasks.push(sub);
    }

    pub(crate) fn clear_subtasks(&self) {
        let mut assign = self.assign.lock().unwrap();
        assign.subtasks.clear();
        assign.thread_task_ids.clear();
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.assign.lock().unwrap().thread_task_ids.len()
    }

    pub(crate) fn num_subtasks(&self) -> usize {
        self.assign.lock().unwrap().subtasks.len()
    }

    pub(crate) fn thread_task_id(&self, thread_id: usize) -> Option<usize> {
        self.assign
            .lock()
            .unwrap()
            .thread_task_ids
            .get(&thread_id)
            .copied()
    }

    /// Re-arms the task for a new step: drops the previous functor, closes
    /// the barriers, resets the checkpoint and every subtask.
    pub(crate) fn restart(&self) {
        let old = self.functor.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: the pointer came from Box::into_raw in set_functor /
            // publish_round and nothing reads it once the step is over.
            unsafe { drop(Box::from_raw(old)) };
        }
        self.begin.close();
        self.checkpoint.store(0, Ordering::Release);
        self.rounds.store(0, Ordering::Release);
        let assign = self.assign.lock().unwrap();
        match self.task_type {
            // Multi-loop end barriers are re-armed per round.
            TaskType::MultiLoop => self.end.close(0),
            _ => self.end.close(assign.subtasks.len() as i32),
        }
        for sub in &assign.subtasks {
            sub.reset();
        }
    }

    /// Publishes the step's functor and opens the begin barrier. At most
    /// one publication per step for basic and loop tasks.
    pub(crate) fn set_functor(&self, f: TaskFunctor) {
        let ptr = Box::into_raw(Box::new(f));
        let old = self.functor.swap(ptr, Ordering::AcqRel);
        assert!(
            old.is_null(),
            "task '{}': functor published twice in one step",
            self.label
        );
        self.functor_set_us
            .store(trace::now_micros(), Ordering::Release);
        self.begin.open();
    }

    /// Publishes one round of a multi-loop task, replacing the previous
    /// round's functor. The caller must have drained the previous round
    /// (end barrier open) first.
    pub(crate) fn publish_round(&self, f: TaskFunctor) {
        assert_eq!(
            self.task_type,
            TaskType::MultiLoop,
            "task '{}': round publication on a non multi-loop task",
            self.label
        );
        let ptr = Box::into_raw(Box::new(f));
        let old = self.functor.swap(ptr, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: the previous round's end barrier fired, so no thread
            // is still executing the old functor.
            unsafe { drop(Box::from_raw(old)) };
        }
        self.functor_set_us
            .store(trace::now_micros(), Ordering::Release);
        self.rounds.fetch_add(1, Ordering::Release);
        self.begin.open();
    }

    fn functor(&self) -> &TaskFunctor {
        let ptr = self.functor.load(Ordering::Acquire);
        assert!(
            !ptr.is_null(),
            "task '{}': functor read before publication",
            self.label
        );
        // SAFETY: published via release store before the begin barrier
        // opened; never replaced while readers are inside a step/round and
        // only dropped by restart between steps.
        unsafe { &*ptr }
    }

    pub(crate) fn functor_set_time_us(&self) -> u64 {
        self.functor_set_us.load(Ordering::Acquire)
    }

    /// Whether the begin barrier is open, i.e. a functor is available.
    pub(crate) fn is_ready(&self) -> bool {
        self.begin.is_open()
    }

    /// Whether every participant has arrived at the end barrier.
    pub(crate) fn is_complete(&self) -> bool {
        self.end.is_open()
    }

    /// Executes this task's functor over `slice`, framed by the begin and
    /// end barriers. This is the per-subtask execution entry; for
    /// coroutine tasks it runs inside a fiber and may suspend partway.
    pub(crate) fn run(&self, slice: Range<Ratio>, sub: &SubTask) {
        {
            let mut times = sub.times.lock().unwrap();
            if times.wait_start_us.is_none() {
                times.wait_start_us = Some(trace::now_micros());
            }
        }
        self.begin.wait();
        let run_start = trace::now_micros();
        sub.times.lock().unwrap().begin_run(run_start);

        match self.functor() {
            TaskFunctor::Basic(f) => f(),
            TaskFunctor::Loop { body, range } => {
                let span = range.subset(slice);
                if self.auto_balance.load(Ordering::Relaxed) {
                    self.run_balanced(body.as_ref(), span, sub);
                } else {
                    for i in span.start..span.end {
                        body(i);
                    }
                }
            }
        }

        let run_end = trace::now_micros();
        sub.times.lock().unwrap().end_run(run_end);
        trace::record_event(&self.label, sub.thread_id, run_start, run_end);
        self.end.mark_arrival();
    }

    /// Executes a stolen iteration range on behalf of `thief`. The thief
    /// was added to the end barrier by `steal_work`.
    pub(crate) fn run_stolen(&self, work: Range<i64>, thief: &SubTask) {
        let run_start = trace::now_micros();
        thief.times.lock().unwrap().begin_run(run_start);
        match self.functor() {
            TaskFunctor::Loop { body, .. } => {
                self.run_balanced(body.as_ref(), work, thief);
            }
            TaskFunctor::Basic(_) => {
                unreachable!("stolen work on a basic task")
            }
        }
        let run_end = trace::now_micros();
        thief.times.lock().unwrap().end_run(run_end);
        trace::record_event(&self.label, thief.thread_id, run_start, run_end);
        self.end.mark_arrival();
    }

    /// Claims iterations one at a time so a concurrent `steal_work` can
    /// shrink the span under the same per-subtask lock.
    fn run_balanced(&self, body: &(dyn Fn(i64) + Send + Sync), span: Range<i64>, sub: &SubTask) {
        {
            let mut info = sub.run_info.lock().unwrap();
            info.next = span.start;
            info.end = span.end;
            info.active = true;
        }
        loop {
            let i = {
                let mut info = sub.run_info.lock().unwrap();
                if info.next >= info.end {
                    info.active = false;
                    break;
                }
                let i = info.next;
                info.next += 1;
                i
            };
            body(i);
        }
    }

    /// Looks for the running subtask with the most remaining iterations
    /// and, if it has at least [`STEAL_THRESHOLD`] left, halves its span
    /// and returns the stolen tail. Registers the thief with the end
    /// barrier before returning.
    pub(crate) fn steal_work(&self, thief: &SubTask) -> Option<Range<i64>> {
        if !self.auto_balance.load(Ordering::Relaxed) {
            return None;
        }
        let _guard = self.balance_lock.lock().unwrap();
        let victim = {
            let assign = self.assign.lock().unwrap();
            let mut best: Option<(Arc<SubTask>, i64)> = None;
            for st in &assign.subtasks {
                if std::ptr::eq(st.as_ref(), thief) {
                    continue;
                }
                let info = st.run_info.lock().unwrap();
                if !info.active {
                    continue;
                }
                let remaining = info.end - info.next;
                if remaining >= STEAL_THRESHOLD
                    && best.as_ref().map_or(true, |(_, r)| remaining > *r)
                {
                    best = Some((Arc::clone(st), remaining));
                }
            }
            best?.0
        };
        let mut info = victim.run_info.lock().unwrap();
        let remaining = info.end - info.next;
        if remaining < STEAL_THRESHOLD {
            return None;
        }
        let steal_start = info.end - remaining / 2;
        let stolen = Range::new(steal_start, info.end);
        info.end = steal_start;
        self.end.add_thread();
        Some(stolen)
    }

    pub(crate) fn wait(&self) {
        self.end.wait();
    }

    pub(crate) fn checkpoint(&self) -> i64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Advances the checkpoint. Checkpoints are monotone within a step.
    pub(crate) fn advance_checkpoint(&self, cp: i64) {
        self.checkpoint.fetch_max(cp, Ordering::AcqRel);
    }

    pub(crate) fn set_coroutine(&self, threads: &[usize], continuations: &[&str]) {
        let mut cfg = self.coroutine.lock().unwrap();
        cfg.threads.extend(threads.iter().copied());
        cfg.next_tasks
            .extend(continuations.iter().map(|s| s.to_string()));
    }

    pub(crate) fn is_coroutine_for(&self, thread_id: usize) -> bool {
        self.coroutine.lock().unwrap().threads.contains(&thread_id)
    }

    pub(crate) fn set_high_priority(&self) {
        self.high_priority.store(true, Ordering::Release);
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    pub(crate) fn enable_auto_balancing(&self) {
        self.auto_balance.store(true, Ordering::Release);
    }

    pub(crate) fn set_reduction(&self, r: Option<Arc<dyn ReduceHandle>>) {
        *self.reduction.write().unwrap() = r;
    }

    pub(crate) fn reduction(&self) -> Option<Arc<dyn ReduceHandle>> {
        self.reduction.read().unwrap().clone()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let ptr = self.functor.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            // SAFETY: sole owner at drop time.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn loop_task_with_sub(label: &str, slice: Range<Ratio>) -> (Arc<Task>, Arc<SubTask>) {
        let task = Arc::new(Task::new(label, TaskType::Loop));
        let sub = Arc::new(SubTask::new(0, slice));
        task.push_subtask(0, Arc::clone(&sub));
        task.restart();
        (task, sub)
    }

    #[test]
    fn test_loop_functor_runs_subrange() {
        let (task, sub) = loop_task_with_sub("loop", Range::new(Ratio::ZERO, Ratio::new(1, 2)));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        task.set_functor(TaskFunctor::loop_over(
            move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            Range::new(0, 10),
        ));
        task.run(sub.range(), &sub);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        task.wait();
        assert!(task.is_complete());
    }

    #[test]
    fn test_restart_drops_functor_and_closes_barriers() {
        let (task, sub) = loop_task_with_sub("restart", Range::full());
        task.set_functor(TaskFunctor::skip_loop());
        task.run(sub.range(), &sub);
        assert!(task.is_ready());
        task.restart();
        assert!(!task.is_ready());
        assert!(!sub.is_done());
        assert!(!task.is_complete());
    }

    #[test]
    #[should_panic(expected = "published twice")]
    fn test_double_publish_panics() {
        let (task, _sub) = loop_task_with_sub("double", Range::full());
        task.set_functor(TaskFunctor::skip_loop());
        task.set_functor(TaskFunctor::skip_loop());
    }

    #[test]
    fn test_task_local_thread_ids_contiguous() {
        let task = Task::new("ids", TaskType::Loop);
        for tid in [7, 3, 7, 9] {
            task.push_subtask(tid, Arc::new(SubTask::new(tid, Range::full())));
        }
        assert_eq!(task.num_threads(), 3);
        assert_eq!(task.num_subtasks(), 4);
        assert_eq!(task.thread_task_id(7), Some(0));
        assert_eq!(task.thread_task_id(3), Some(1));
        assert_eq!(task.thread_task_id(9), Some(2));
        assert_eq!(task.thread_task_id(4), None);
    }

    #[test]
    fn test_steal_work_halves_victim() {
        let task = Arc::new(Task::new("steal", TaskType::Loop));
        task.enable_auto_balancing();
        let victim = Arc::new(SubTask::new(0, Range::full()));
        let thief = Arc::new(SubTask::new(1, Range::full()));
        task.push_subtask(0, Arc::clone(&victim));
        task.push_subtask(1, Arc::clone(&thief));
        task.restart();

        {
            let mut info = victim.run_info.lock().unwrap();
            info.next = 10;
            info.end = 110;
            info.active = true;
        }
        let stolen = task.steal_work(&thief).expect("victim had work");
        assert_eq!(stolen, Range::new(60, 110));
        assert_eq!(victim.run_info.lock().unwrap().end, 60);

        // Below the threshold nothing is stolen.
        {
            let mut info = victim.run_info.lock().unwrap();
            info.next = 59;
        }
        assert!(task.steal_work(&thief).is_none());
    }

    #[test]
    fn test_checkpoint_monotone() {
        let task = Task::new("cp", TaskType::Basic);
        task.advance_checkpoint(3);
        task.advance_checkpoint(1);
        assert_eq!(task.checkpoint(), 3);
        task.advance_checkpoint(5);
        assert_eq!(task.checkpoint(), 5);
    }
}
