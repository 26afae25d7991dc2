#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;

#[macro_use]
mod log;

mod address_space;
mod auto_remote_syscalls;
mod event;
mod extra_registers;
mod flags;
mod gdb_connection;
mod gdb_register;
mod kernel_abi;
mod kernel_metadata;
mod perf_counters;
mod registers;
mod remote_ptr;
mod scoped_fd;
mod session;
mod sig;
mod sighandlers;
mod syscallbuf;
mod task;
mod task_group;
mod trace_frame;
mod trace_stream;
mod util;
mod wait_status;

fn main() {
    // The record/replay front end drives this core; standalone invocation
    // just validates that the machine can run it at all.
    perf_counters::init_pmu();
    if !perf_counters::is_perf_supported() {
        std::process::exit(1);
    }
    eprintln!("retrace core: performance counters available, PMU recognized");
}
