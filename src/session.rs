use crate::log::LogLevel::LogDebug;
use crate::task::{Task, TaskSharedPtr};
use crate::task_group::TaskGroup;
use crate::trace_stream::{TraceWriter, TraceWriterSharedPtr};
use libc::pid_t;
use std::collections::HashMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionKind {
    Recording,
    Replaying,
}

/// The registry of live tasks, keyed by recorded tid. Deliberately thin:
/// scheduling and trace interpretation happen above this layer.
pub struct Session {
    kind: SessionKind,
    tasks: HashMap<pid_t, TaskSharedPtr>,
    trace: TraceWriterSharedPtr,
}

impl Session {
    pub fn new(kind: SessionKind) -> Session {
        Session {
            kind,
            tasks: HashMap::new(),
            trace: TraceWriter::new(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_recording(&self) -> bool {
        self.kind == SessionKind::Recording
    }

    pub fn trace(&self) -> TraceWriterSharedPtr {
        self.trace.clone()
    }

    pub fn find_task(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks.get(&rec_tid).cloned()
    }

    pub fn on_create(&mut self, t: TaskSharedPtr) {
        let rec_tid = t.borrow().rec_tid;
        log!(LogDebug, "on_create({})", rec_tid);
        self.tasks.insert(rec_tid, t);
    }

    pub fn on_destroy(&mut self, rec_tid: pid_t) {
        log!(LogDebug, "on_destroy({})", rec_tid);
        self.tasks.remove(&rec_tid);
    }

    pub fn tasks(&self) -> &HashMap<pid_t, TaskSharedPtr> {
        &self.tasks
    }

    /// Mark every member of `tg` as possibly-runaway; after this the
    /// scheduler must not block on any individual member. `active` is the
    /// task whose event triggered the destabilization (its handle is
    /// already borrowed by the caller).
    pub fn destabilize_task_group(&self, tg: &TaskGroup, active: &Task) {
        log!(LogDebug, "destabilizing task group {}", tg.tgid);
        active.unstable.set(true);
        for tid in tg.task_set() {
            if *tid == active.tid {
                continue;
            }
            for t in self.tasks.values() {
                if let Ok(t) = t.try_borrow() {
                    if t.tid == *tid {
                        t.unstable.set(true);
                        log!(LogDebug, "  destabilized task {}", t.tid);
                    }
                }
            }
        }
    }

    /// The thread-list view the debug server hands to a client.
    pub fn thread_ids(&self) -> Vec<pid_t> {
        let mut ids: Vec<pid_t> = self.tasks.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (rec_tid, t) in self.tasks.drain() {
            log!(LogDebug, "session dropping task {}", rec_tid);
            t.borrow_mut().destroy();
        }
    }
}

impl Session {
    /// Fork, configure, and seize the root tracee, and register it.
    pub fn spawn_task(
        &mut self,
        exe: &str,
        argv: &[String],
        envp: &[String],
        rec_tid: Option<pid_t>,
    ) -> TaskSharedPtr {
        let t = Task::spawn(self.kind, self.trace.clone(), exe, argv, envp, rec_tid);
        let shared = Task::into_shared(t);
        self.on_create(shared.clone());
        shared
    }

    /// Register a task created by clone_task() on an existing member.
    pub fn register_task(&mut self, t: Task) -> TaskSharedPtr {
        let shared = Task::into_shared(t);
        self.on_create(shared.clone());
        shared
    }
}
