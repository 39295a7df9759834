//! Progress reporting for the slow search passes.
//!
//! The model search and the empirical sorter run on one thread, but the
//! hash-size trials run in parallel, so the sink takes `&self` and
//! implementations serialise internally.

use std::io::{self, Write};
use std::sync::Mutex;

pub trait Progress: Sync {
    fn begin_task(&self, _name: &str) {}
    fn update(&self, _step: usize, _total: usize) {}
    fn end_task(&self) {}
}

/// Discards all progress events.
pub struct NullProgress;

impl Progress for NullProgress {}

/// Renders a task name and a percentage on stdout, rewriting the same
/// line as the task advances.
pub struct ConsoleProgress {
    state: Mutex<ConsoleState>,
}

struct ConsoleState {
    task: String,
    last_percent: usize,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState { task: String::new(), last_percent: 0 }),
        }
    }
}

impl Progress for ConsoleProgress {
    fn begin_task(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.task = name.to_string();
        state.last_percent = usize::MAX;
        print!("{}: ", name);
        let _ = io::stdout().flush();
    }

    fn update(&self, step: usize, total: usize) {
        let mut state = self.state.lock().unwrap();
        let percent = if total == 0 { 100 } else { step * 100 / total };
        if percent != state.last_percent {
            state.last_percent = percent;
            print!("\r{}: {:3}%", state.task, percent);
            let _ = io::stdout().flush();
        }
    }

    fn end_task(&self) {
        println!();
    }
}
