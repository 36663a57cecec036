//! Two coroutine tasks on one thread printing an interleaved greeting.
//!
//! Each task prints one character and pauses; the scheduler hands the
//! thread to the other task at every pause, so the output is the
//! deterministic interleave of the two strings.

use lockstep::Scheduler;
use std::io::Write;
use std::sync::Arc;

fn main() {
    lockstep::startup(1);

    let sched = Scheduler::new("interleave");
    sched.clear_assignments();
    sched.assign_run("task_f", 0);
    sched.assign_run("task_g", 0);
    sched.set_coroutine("task_f", &[0], &["task_g"]);
    sched.set_coroutine("task_g", &[0], &["task_f"]);

    sched.next_step();
    {
        let inner = Arc::clone(&sched);
        sched.run("task_f", move || {
            for ch in ['H', 'l', 'o', 'W', 'r', 'd'] {
                print!("{}", ch);
                std::io::stdout().flush().unwrap();
                if ch != 'd' {
                    inner.pause();
                }
            }
        });
    }
    {
        let inner = Arc::clone(&sched);
        sched.run("task_g", move || {
            for ch in ['e', 'l', ' ', 'o', 'l', '\n'] {
                print!("{}", ch);
                std::io::stdout().flush().unwrap();
                if ch != '\n' {
                    inner.pause();
                }
            }
        });
    }
    sched.wait();

    lockstep::shutdown().expect("clean shutdown");
}
