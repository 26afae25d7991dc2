use crate::log::LogLevel::LogDebug;
use libc::pid_t;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

pub type TaskGroupSharedPtr = Rc<RefCell<TaskGroup>>;

/// Tracks a group of tasks with an associated ID, set from the original
/// "thread group leader", the child of fork() which became the ancestor
/// of all other threads in the group. Each constituent task holds a
/// shared handle to this; this holds only member tids.
pub struct TaskGroup {
    /// The recorded thread-group id.
    pub tgid: pid_t,
    /// The real OS thread-group id.
    pub real_tgid: pid_t,
    pub exit_code: i32,
    /// Set once the whole group is dying and individual members may no
    /// longer be runnable; see Task::destabilize_task_group().
    pub destabilized: bool,
    tasks: HashSet<pid_t>,
}

impl TaskGroup {
    pub fn new(tgid: pid_t, real_tgid: pid_t) -> TaskGroupSharedPtr {
        log!(
            LogDebug,
            "creating new task group {} (real tgid:{})",
            tgid,
            real_tgid
        );
        Rc::new(RefCell::new(TaskGroup {
            tgid,
            real_tgid,
            exit_code: -1,
            destabilized: false,
            tasks: HashSet::new(),
        }))
    }

    pub fn insert_task(&mut self, tid: pid_t) {
        self.tasks.insert(tid);
    }

    pub fn erase_task(&mut self, tid: pid_t) {
        self.tasks.remove(&tid);
    }

    pub fn task_set(&self) -> &HashSet<pid_t> {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let tg = TaskGroup::new(100, 100);
        let mut tg = tg.borrow_mut();
        tg.insert_task(100);
        tg.insert_task(101);
        assert_eq!(2, tg.task_set().len());
        tg.erase_task(100);
        assert!(!tg.task_set().contains(&100));
        assert_eq!(-1, tg.exit_code);
        assert!(!tg.destabilized);
    }
}
