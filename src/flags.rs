use std::env;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Process-wide configuration. The command-line front end is an external
/// collaborator; everything the core consults arrives through RETRACE_*
/// environment variables and is frozen at first use.
#[derive(Clone)]
pub struct Flags {
    /// Default rbc budget programmed between trace events during recording.
    pub max_rbc: i64,
    /// Whether tracees are given a syscall buffer at all.
    pub use_syscall_buffer: bool,
    /// Suppress warnings related to environmental features outside our
    /// control (CPU errata, missing kernel features).
    pub suppress_environment_warnings: bool,
    /// User override for microarchitecture detection, e.g. when running
    /// under a hypervisor that garbles CPUID.
    pub forced_uarch: Option<String>,
    /// Checksum tracee memory at each recorded event, for divergence hunting.
    pub checksum: bool,
    /// Address the debug server binds; loopback when unset.
    pub dbg_addr: Option<String>,
    /// Port the debug server starts probing from.
    pub dbg_port: Option<u16>,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v != "0" && !v.is_empty(),
        Err(_) => default,
    }
}

fn init_flags() -> Flags {
    Flags {
        max_rbc: env::var("RETRACE_MAX_RBC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500_000),
        use_syscall_buffer: env_bool("RETRACE_USE_SYSCALLBUF", true),
        suppress_environment_warnings: env_bool("RETRACE_SUPPRESS_ENV_WARNINGS", false),
        forced_uarch: env::var("RETRACE_FORCED_UARCH").ok(),
        checksum: env_bool("RETRACE_CHECKSUM", false),
        dbg_addr: env::var("RETRACE_DBG_ADDR").ok(),
        dbg_port: env::var("RETRACE_DBG_PORT").ok().and_then(|v| v.parse().ok()),
    }
}
