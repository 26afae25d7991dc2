//! The remote-serial-protocol server: accepts one debugger client over
//! TCP and translates its packets into requests against the replay core.
//!
//! Much of this implementation is based on the documentation at
//! <http://sourceware.org/gdb/onlinedocs/gdb/Packets.html>

use crate::gdb_register::MAX_REG_SIZE_BYTES;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::scoped_fd::ScopedFd;
use libc::pid_t;
use memchr::{memchr, memchr2};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, IpAddr, SockAddr,
    SockFlag, SockType,
};
use nix::unistd::{read, write};
use std::os::unix::io::RawFd;

const INTERRUPT_CHAR: u8 = 0x03;

pub type DbgThreadId = pid_t;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DbgRequestType {
    None,
    GetCurrentThread,
    GetThreadList,
    GetIsThreadAlive,
    GetMem,
    GetOffsets,
    GetReg,
    GetRegs,
    GetStopReason,
    SetContinueThread,
    SetQueryThread,
    Interrupt,
    Continue,
    Step,
    SetSwBreak,
    SetHwBreak,
    SetWrWatch,
    SetRdWatch,
    SetRwWatch,
    RemoveSwBreak,
    RemoveHwBreak,
    RemoveWrWatch,
    RemoveRdWatch,
    RemoveRwWatch,
}
use DbgRequestType::*;

const SET_WATCH_KINDS: [DbgRequestType; 5] =
    [SetSwBreak, SetHwBreak, SetWrWatch, SetRdWatch, SetRwWatch];
const REMOVE_WATCH_KINDS: [DbgRequestType; 5] = [
    RemoveSwBreak,
    RemoveHwBreak,
    RemoveWrWatch,
    RemoveRdWatch,
    RemoveRwWatch,
];

/// One request from the debugger that the replay driver must service.
#[derive(Copy, Clone, Debug)]
pub struct DbgRequest {
    pub type_: DbgRequestType,
    pub target: DbgThreadId,
    pub mem_addr: usize,
    pub mem_len: usize,
    pub reg: u32,
}

impl DbgRequest {
    fn none() -> DbgRequest {
        DbgRequest {
            type_: None_,
            target: 0,
            mem_addr: 0,
            mem_len: 0,
            reg: 0,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self.type_, Continue | Step)
    }

    pub fn is_watch_request(&self) -> bool {
        SET_WATCH_KINDS.contains(&self.type_) || REMOVE_WATCH_KINDS.contains(&self.type_)
    }
}

use DbgRequestType::None as None_;

fn request_needs_immediate_response(req: &DbgRequest) -> bool {
    !matches!(req.type_, None_ | Continue | Step)
}

/// A possibly-undefined register value handed to the wire encoder.
#[derive(Copy, Clone)]
pub struct DbgRegValue {
    pub name: u32,
    pub value: [u8; MAX_REG_SIZE_BYTES],
    pub size: usize,
    pub defined: bool,
}

/// This struct wraps up the state of the remote protocol, so that we can
/// offer a (mostly) stateless interface to clients.
pub struct GdbConnection {
    /// Current request to be processed.
    req: DbgRequest,
    /// Thread to be resumed.
    resume_thread: DbgThreadId,
    /// Thread for get/set requests.
    query_thread: DbgThreadId,
    /// True when we can request symbol lookups.
    serving_symbol_lookups: bool,
    /// True when "no-ack mode" is enabled, in which we don't have to send
    /// ack packets back to the debugger. This is a huge perf win.
    no_ack: bool,
    /// True once QNonStop has been negotiated; resume requests in all-stop
    /// mode are a fatal protocol error.
    non_stop: bool,
    sock_fd: ScopedFd,
    /// Buffered input from the debugger.
    inbuf: Vec<u8>,
    /// Index of the '#' character terminating the current packet.
    packetend: usize,
    /// Buffered output for the debugger.
    outbuf: Vec<u8>,
}

/// Translate a linux-x86 signal number to the debugger's fixed internal
/// numbering, per gdb/include/gdb/signals.def.
pub fn to_gdb_signum(sig: i32) -> i32 {
    if libc::SIGRTMIN() <= sig && sig <= libc::SIGRTMAX() {
        // GDB_SIGNAL_REALTIME_34 is numbered 46, hence this offset.
        return sig + 12;
    }
    match sig {
        0 => 0,
        libc::SIGHUP => 1,
        libc::SIGINT => 2,
        libc::SIGQUIT => 3,
        libc::SIGILL => 4,
        libc::SIGTRAP => 5,
        libc::SIGABRT => 6,
        libc::SIGBUS => 10,
        libc::SIGFPE => 8,
        libc::SIGKILL => 9,
        libc::SIGUSR1 => 30,
        libc::SIGSEGV => 11,
        libc::SIGUSR2 => 31,
        libc::SIGPIPE => 13,
        libc::SIGALRM => 14,
        libc::SIGTERM => 15,
        // The debugger hasn't heard of SIGSTKFLT, so this is arbitrarily
        // made up. SIGDANGER just sounds cool.
        libc::SIGSTKFLT => 38, /* GDB_SIGNAL_DANGER */
        libc::SIGCHLD => 20,
        libc::SIGCONT => 19,
        libc::SIGSTOP => 17,
        libc::SIGTSTP => 18,
        libc::SIGTTIN => 21,
        libc::SIGTTOU => 22,
        libc::SIGURG => 16,
        libc::SIGXCPU => 24,
        libc::SIGXFSZ => 25,
        libc::SIGVTALRM => 26,
        libc::SIGPROF => 27,
        libc::SIGWINCH => 28,
        libc::SIGIO => 23,
        libc::SIGPWR => 32,
        libc::SIGSYS => 12,
        _ => fatal!("Unknown signal {}", sig),
    }
}

/// Parse a debugger thread-id (hex, possibly negative) from the front of
/// `s`; returns the value and the rest of the string.
fn parse_threadid(s: &str) -> (DbgThreadId, &str) {
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        Option::None => (1i64, s),
    };
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or_else(|| s.len());
    let value = i64::from_str_radix(&s[..end], 16).unwrap_or(0);
    ((sign * value) as DbgThreadId, &s[end..])
}

fn parse_hex(s: &str) -> (usize, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or_else(|| s.len());
    let value = usize::from_str_radix(&s[..end], 16).unwrap_or(0);
    (value, &s[end..])
}

pub fn packet_checksum(payload: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in payload {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

/// Wait for a debugger using the configured bind address and port.
/// When no port was configured, start from the default and probe
/// upward for a free one.
pub fn await_debugger() -> GdbConnection {
    const DEFAULT_DBG_PORT: u16 = 2345;
    let flags = crate::flags::Flags::get();
    let addr = flags
        .dbg_addr
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_owned());
    let (port, probe) = match flags.dbg_port {
        Some(port) => (port, false),
        Option::None => (DEFAULT_DBG_PORT, true),
    };
    GdbConnection::await_client_connection(&addr, port, probe)
}

impl GdbConnection {
    /// Wait for a debugger client to connect to `addr`:`port`. When
    /// `probe` is set, on EADDRINUSE/EACCES keep trying successive ports.
    pub fn await_client_connection(addr: &str, port: u16, probe: bool) -> GdbConnection {
        let listen_fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            Option::<nix::sys::socket::SockProtocol>::None,
        )
        .unwrap_or_else(|e| fatal!("Failed to create listen socket: {}", e));
        setsockopt(listen_fd, sockopt::ReuseAddr, &true).unwrap_or(());

        let ip: std::net::Ipv4Addr = addr.parse().unwrap_or_else(|_| {
            fatal!("Can't parse debug server address {}", addr);
        });
        let o = ip.octets();

        let mut port = port;
        loop {
            let sockaddr = SockAddr::new_inet(InetAddr::new(
                IpAddr::new_v4(o[0], o[1], o[2], o[3]),
                port,
            ));
            match bind(listen_fd, &sockaddr) {
                Err(e)
                    if probe
                        && (e.as_errno() == Some(Errno::EADDRINUSE)
                            || e.as_errno() == Some(Errno::EACCES)) =>
                {
                    port = port.wrapping_add(1);
                    continue;
                }
                Err(_) => {
                    clean_fatal!("Couldn't bind to port {}", port);
                }
                Ok(()) => (),
            }
            match listen(listen_fd, 1) {
                Ok(()) => break,
                Err(e) if probe && e.as_errno() == Some(Errno::EADDRINUSE) => {
                    port = port.wrapping_add(1);
                    continue;
                }
                Err(_) => {
                    clean_fatal!("Couldn't listen on port {}", port);
                }
            }
        }
        eprintln!("(debug server listening on {}:{})", addr, port);

        // Block until the debugging client connects to us.
        let client_fd = accept(listen_fd)
            .unwrap_or_else(|e| fatal!("Failed to accept debugger connection: {}", e));
        let _ = nix::unistd::close(listen_fd);

        unsafe {
            let flags = libc::fcntl(client_fd, libc::F_GETFD);
            if flags < 0 {
                fatal!("Can't GETFD flags");
            }
            if libc::fcntl(client_fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0 {
                fatal!("Can't make client socket CLOEXEC");
            }
            if libc::fcntl(client_fd, libc::F_SETFL, libc::O_NONBLOCK) != 0 {
                fatal!("Can't make client socket NONBLOCK");
            }
        }
        Self::from_fd(client_fd)
    }

    /// Wrap an already-connected socket; the tests drive the protocol
    /// over a socketpair this way.
    pub fn from_fd(fd: RawFd) -> GdbConnection {
        GdbConnection {
            req: DbgRequest::none(),
            resume_thread: 0,
            query_thread: 0,
            serving_symbol_lookups: false,
            no_ack: false,
            non_stop: false,
            sock_fd: ScopedFd::from_raw(fd),
            inbuf: Vec::new(),
            packetend: 0,
            outbuf: Vec::new(),
        }
    }

    // -----------------------------------------------------------------
    // Byte-level I/O
    // -----------------------------------------------------------------

    /// Poll for data to or from the debugger, waiting `timeout_ms`. 0
    /// means "don't wait", and -1 means "wait forever". Returns true if
    /// data is ready by the end of the timeout.
    fn poll_socket(&self, events: PollFlags, timeout_ms: i32) -> bool {
        let mut pfd = [PollFd::new(self.sock_fd.as_raw(), events)];
        match poll(&mut pfd, timeout_ms) {
            Ok(ret) => ret > 0,
            Err(_) => fatal!("Polling debugger socket failed"),
        }
    }

    fn poll_incoming(&self, timeout_ms: i32) -> bool {
        self.poll_socket(PollFlags::POLLIN, timeout_ms)
    }

    fn poll_outgoing(&self, timeout_ms: i32) -> bool {
        self.poll_socket(PollFlags::POLLOUT, timeout_ms)
    }

    /// read() incoming data exactly one time, successfully. May block.
    fn read_data_once(&mut self) {
        // Wait until there's data, instead of busy-looping on EAGAIN.
        self.poll_incoming(-1);
        let mut buf = [0u8; 4096];
        match read(self.sock_fd.as_raw(), &mut buf) {
            Ok(nread) if nread > 0 => self.inbuf.extend_from_slice(&buf[..nread]),
            _ => {
                fatal!("Error reading from debugger");
            }
        }
    }

    /// Send all pending output to the debugger. May block.
    fn write_flush(&mut self) {
        let mut write_index = 0;
        log!(
            LogDebug,
            "write_flush: '{}'",
            String::from_utf8_lossy(&self.outbuf)
        );
        while write_index < self.outbuf.len() {
            self.poll_outgoing(-1);
            match write(self.sock_fd.as_raw(), &self.outbuf[write_index..]) {
                Ok(nwritten) => write_index += nwritten,
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => continue,
                Err(_) => {
                    fatal!("Error writing to debugger");
                }
            }
        }
        self.outbuf.clear();
    }

    fn write_data_raw(&mut self, data: &[u8]) {
        self.outbuf.extend_from_slice(data);
    }

    fn write_hex(&mut self, hex: u64) {
        let buf = format!("{:02x}", hex);
        self.write_data_raw(buf.as_bytes());
    }

    fn write_packet_payload(&mut self, data: &[u8]) {
        let checksum = packet_checksum(data);
        self.write_data_raw(data);
        self.write_data_raw(b"#");
        self.write_hex(checksum as u64);
    }

    fn write_packet(&mut self, data: &str) {
        self.write_data_raw(b"$");
        self.write_packet_payload(data.as_bytes());
    }

    fn write_async_packet(&mut self, data: &str) {
        self.write_data_raw(b"%");
        self.write_packet_payload(data.as_bytes());
    }

    fn write_hex_encoded_bytes(&mut self, data: &[u8]) {
        let mut buf = String::with_capacity(2 * data.len());
        for b in data {
            buf.push_str(&format!("{:02x}", b));
        }
        self.write_packet(&buf);
    }

    // -----------------------------------------------------------------
    // Packet framing
    // -----------------------------------------------------------------

    /// Consume bytes in the input buffer until start-of-packet ('$') or
    /// the interrupt character is seen. Does not block. Returns true if
    /// seen.
    fn skip_to_packet_start(&mut self) -> bool {
        match memchr2(b'$', INTERRUPT_CHAR, &self.inbuf) {
            Some(p) => {
                self.inbuf.drain(..p);
                debug_assert!(self.inbuf[0] == b'$' || self.inbuf[0] == INTERRUPT_CHAR);
                true
            }
            Option::None => {
                // Discard all read bytes, which we don't care about.
                self.inbuf.clear();
                false
            }
        }
    }

    /// Returns true if there's a new packet to be read or processed
    /// (whether incomplete or not).
    fn sniff_packet(&mut self) -> bool {
        if self.skip_to_packet_start() {
            // We've already seen a (possibly partial) packet.
            return true;
        }
        debug_assert!(self.inbuf.is_empty());
        self.poll_incoming(0 /* don't wait */)
    }

    /// Block until the sequence of bytes "[^$]*\$[^#]*#.*" has been read
    /// from the client fd: one (or more) packets.
    ///
    /// NB: we're ignoring "+/-" acks from the client. There's no sane
    /// reason for a damaged packet over TCP to heal on retransmission,
    /// and we're likewise ignoring the packet checksums.
    fn read_packet(&mut self) {
        while !self.skip_to_packet_start() {
            self.read_data_once();
        }

        if self.inbuf[0] == INTERRUPT_CHAR {
            // Interrupts are kind of an ugly duckling in the protocol.
            self.packetend = 1;
            return;
        }

        // Read until we see end-of-packet.
        let mut checkedlen = 0;
        loop {
            match memchr(b'#', &self.inbuf[checkedlen..]) {
                Some(i) => {
                    self.packetend = checkedlen + i;
                    break;
                }
                Option::None => {
                    checkedlen = self.inbuf.len();
                    self.read_data_once();
                }
            }
        }
        debug_assert!(self.inbuf[0] == b'$' && self.packetend < self.inbuf.len());

        // Acknowledge receipt of the packet.
        if !self.no_ack {
            self.write_data_raw(b"+");
            self.write_flush();
        }
    }

    // -----------------------------------------------------------------
    // Packet dispatch
    // -----------------------------------------------------------------

    fn consume_request(&mut self) {
        self.req = DbgRequest::none();
        self.write_flush();
    }

    /// Handle a 'q' query. Returns true when the request must be handled
    /// by the driver.
    fn query(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(':') {
            Some(pos) => (&payload[..pos], &payload[pos + 1..]),
            Option::None => (payload, ""),
        };

        if name == "C" {
            log!(LogDebug, "debugger requests current thread ID");
            self.req.type_ = GetCurrentThread;
            return true;
        }
        if name == "Attached" {
            log!(LogDebug, "debugger asks if this is a new or existing process");
            // Tell it this is an existing process; it might be.
            self.write_packet("1");
            return false;
        }
        if name == "fThreadInfo" {
            log!(LogDebug, "debugger asks for thread list");
            self.req.type_ = GetThreadList;
            return true;
        }
        if name == "sThreadInfo" {
            self.write_packet("l"); // "end of list"
            return false;
        }
        if name == "GetTLSAddr" {
            log!(LogDebug, "debugger asks for TLS addr");
            self.write_packet("");
            return false;
        }
        if name == "Offsets" {
            log!(LogDebug, "debugger asks for section offsets");
            self.req.type_ = GetOffsets;
            self.req.target = self.query_thread;
            return true;
        }
        if name.starts_with('P') {
            // The docs say not to use this packet.
            self.write_packet("");
            return false;
        }
        if name == "Supported" {
            log!(LogDebug, "debugger supports {}", args);
            self.write_packet("QStartNoAckMode+;QNonStop+");
            self.write_packet("QNonStop+");
            return false;
        }
        if name == "Symbol" {
            log!(LogDebug, "debugger is ready for symbol lookups");
            self.serving_symbol_lookups = true;
            self.write_packet("OK");
            return false;
        }
        if name.starts_with("ThreadExtraInfo") {
            self.write_hex_encoded_bytes(b"retrace tracee");
            return false;
        }
        if name == "TStatus" {
            log!(LogDebug, "debugger asks for trace status");
            // From the docs it appears we should reply "T0" here, but
            // that only invites more trace queries. Pretend we don't know
            // what it's talking about.
            self.write_packet("");
            return false;
        }

        log!(LogWarn, "Unhandled debugger query: q{}", name);
        self.write_packet("");
        false
    }

    /// Handle a 'Q' set. Returns true when the request must be handled by
    /// the driver.
    fn set_var(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(':') {
            Some(pos) => (&payload[..pos], &payload[pos + 1..]),
            Option::None => (payload, ""),
        };

        if name == "StartNoAckMode" {
            self.write_packet("OK");
            self.no_ack = true;
            return false;
        }
        if name == "NonStop" {
            if args != "1" {
                fatal!(
                    "debugger requests NonStop:{}, but this stub only \
                     supports enabling non-stop",
                    args
                );
            }
            self.write_packet("OK");
            self.non_stop = true;
            return false;
        }

        log!(LogWarn, "Unhandled debugger set: Q{}({})", name, args);
        self.write_packet("");
        false
    }

    fn process_vpacket(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(';') {
            Some(pos) => (&payload[..pos], &payload[pos + 1..]),
            Option::None => (payload, ""),
        };

        if name == "Cont" {
            let mut rest = args;
            let cmd = match rest.chars().next() {
                Some(c) => c,
                Option::None => {
                    log!(LogWarn, "Empty vCont command");
                    self.write_packet("");
                    return false;
                }
            };
            rest = &rest[1..];

            match cmd {
                'C' | 'c' => {
                    if cmd == 'C' {
                        log!(LogWarn, "Ignoring request to deliver signal ({})", rest);
                    }
                    self.req.type_ = Continue;
                    self.req.target = self.resume_thread;
                    self.write_packet("OK");
                    return true;
                }
                's' => {
                    self.req.type_ = Step;
                    if let Some(tid_str) = rest.strip_prefix(':') {
                        let (target, trailer) = parse_threadid(tid_str);
                        self.req.target = target;
                        debug_assert!(trailer.is_empty() || trailer == ";c");
                    } else {
                        self.req.target = self.resume_thread;
                    }
                    self.write_packet("OK");
                    return true;
                }
                't' => {
                    let tid_str = rest.strip_prefix(':').unwrap_or(rest);
                    let (thread, _) = parse_threadid(tid_str);
                    self.write_packet("OK");
                    // The thread is already stopped, or else we wouldn't
                    // have been able to process this request.
                    self.send_stop_reply_packet(true, "Stop:", thread, 0);
                    return false;
                }
                _ => {
                    log!(LogWarn, "Unhandled vCont command {}({})", cmd, rest);
                    self.write_packet("");
                    return false;
                }
            }
        }

        if name == "Cont?" {
            log!(LogDebug, "debugger queries which continue commands we support");
            self.write_packet("vCont;c;C;s;S;t;");
            return false;
        }

        if name == "Stopped" {
            log!(LogDebug, "debugger ack'ing stopped notification");
            // Tracee threads can only stop after debugger resume
            // requests, so there can only be one un-ack'd stop
            // notification: the one we sent in the async packet.
            self.write_packet("OK");
            return false;
        }

        log!(LogWarn, "Unhandled debugger vpacket: v{}", name);
        self.write_packet("");
        false
    }

    /// Returns true when the packet produced a request the driver must
    /// service; false when it was handled internally.
    fn process_packet(&mut self) -> bool {
        debug_assert!(
            self.inbuf[0] == INTERRUPT_CHAR
                || (self.inbuf[0] == b'$'
                    && memchr(b'#', &self.inbuf) == Some(self.packetend))
        );

        let interrupt = self.inbuf[0] == INTERRUPT_CHAR;
        let (request, payload_owned) = if interrupt {
            (INTERRUPT_CHAR as char, String::new())
        } else {
            let request = self.inbuf[1] as char;
            // An empty packet "$#00" has nothing between the request
            // char and the '#'.
            let payload_start = self.packetend.min(2);
            let payload =
                String::from_utf8_lossy(&self.inbuf[payload_start..self.packetend]).into_owned();
            (request, payload)
        };
        let payload = payload_owned.as_str();

        log!(LogDebug, "raw request {}({})", request, payload);

        // These requests can be satisfied without knowing whether the
        // debugger has requested non-stop mode or not.
        let mut handled = true;
        let ret = match request {
            'D' => {
                log!(LogInfo, "debugger is detaching from us, exiting");
                self.write_packet("OK");
                self.write_flush();
                std::process::exit(0);
            }
            'H' => {
                let mut chars = payload.chars();
                let kind = chars.next().unwrap_or('g');
                self.req.type_ = if kind == 'c' {
                    SetContinueThread
                } else {
                    SetQueryThread
                };
                let (target, trailer) = parse_threadid(chars.as_str());
                self.req.target = target;
                debug_assert!(trailer.is_empty());
                log!(LogDebug, "debugger selecting {}", self.req.target);
                true
            }
            'q' => self.query(payload),
            'Q' => self.set_var(payload),
            _ => {
                handled = false;
                false
            }
        };
        if handled {
            return self.finish_packet(ret);
        }

        if !self.non_stop {
            fatal!(
                "Request for {}({}) when in unsupported all-stop mode",
                request,
                payload
            );
        }

        let ret = match request {
            c if c == INTERRUPT_CHAR as char => {
                log!(LogDebug, "debugger requests interrupt");
                self.req.type_ = Interrupt;
                true
            }
            'g' => {
                log!(LogDebug, "debugger requests registers");
                self.req.type_ = GetRegs;
                self.req.target = self.query_thread;
                true
            }
            'G' => {
                // We can't let the debugger spray registers in general,
                // because it may cause replay to diverge. Some writes may
                // be OK; see how far we get ignoring these requests.
                self.write_packet("");
                false
            }
            'k' => {
                log!(LogInfo, "debugger requests kill, exiting");
                self.write_packet("OK");
                self.write_flush();
                std::process::exit(0);
            }
            'm' => {
                self.req.type_ = GetMem;
                self.req.target = self.query_thread;
                let (addr, rest) = parse_hex(payload);
                let rest = rest.strip_prefix(',').unwrap_or(rest);
                let (len, _) = parse_hex(rest);
                self.req.mem_addr = addr;
                self.req.mem_len = len;
                log!(
                    LogDebug,
                    "debugger requests memory (addr={:#x}, len={})",
                    addr,
                    len
                );
                true
            }
            'M' => {
                // We can't allow the debugger to write arbitrary memory,
                // or the replay may diverge.
                self.write_packet("");
                false
            }
            'p' => {
                let (regno, _) = parse_hex(payload);
                self.req.type_ = GetReg;
                self.req.target = self.query_thread;
                self.req.reg = regno as u32;
                log!(LogDebug, "debugger requests register value ({})", regno);
                true
            }
            'P' => {
                // Like 'G': ignore register writes.
                self.write_packet("");
                false
            }
            'T' => {
                let (target, _) = parse_threadid(payload);
                self.req.type_ = GetIsThreadAlive;
                self.req.target = target;
                log!(LogDebug, "debugger wants to know if {} is alive", target);
                true
            }
            'v' => self.process_vpacket(payload),
            'X' => {
                // No memory writes; see 'M'.
                self.write_packet("");
                false
            }
            'z' | 'Z' => {
                let (type_, rest) = parse_hex(payload);
                let rest = rest.strip_prefix(',').unwrap_or(rest);
                if type_ > 4 {
                    log!(LogWarn, "Unknown watch type {}", type_);
                    self.write_packet("");
                    false
                } else {
                    self.req.type_ = if request == 'Z' {
                        SET_WATCH_KINDS[type_]
                    } else {
                        REMOVE_WATCH_KINDS[type_]
                    };
                    let (addr, rest) = parse_hex(rest);
                    let rest = rest.strip_prefix(',').unwrap_or(rest);
                    let (len, _) = parse_hex(rest);
                    self.req.mem_addr = addr;
                    self.req.mem_len = len;
                    log!(
                        LogDebug,
                        "debugger requests {} breakpoint (addr={:#x}, len={})",
                        if request == 'Z' { "set" } else { "remove" },
                        addr,
                        len
                    );
                    true
                }
            }
            '?' => {
                log!(LogDebug, "debugger requests stop reason");
                self.req.type_ = GetStopReason;
                self.req.target = self.query_thread;
                true
            }
            _ => {
                log!(LogWarn, "Unhandled debugger request '{}'", request);
                // Play dumb and hope the debugger doesn't /really/ need
                // this request.
                self.write_packet("");
                false
            }
        };
        self.finish_packet(ret)
    }

    fn finish_packet(&mut self, ret: bool) -> bool {
        // Erase the newly processed packet from the input buffer.
        self.inbuf.drain(..self.packetend);
        self.packetend = 0;

        // If we processed the request internally, consume it.
        if !ret {
            self.consume_request();
        }
        ret
    }

    /// Return the current request to be processed, reading and processing
    /// packets as needed. If no new bytes are available and the debugger
    /// has already asked us to resume, returns that resume request
    /// immediately; otherwise blocks until a request requiring the
    /// driver's attention is produced.
    pub fn get_request(&mut self) -> DbgRequest {
        // Can't ask for the next request until you've satisfied the
        // current one, for requests that need an immediate response.
        debug_assert!(!request_needs_immediate_response(&self.req));

        if !self.sniff_packet() && self.req.is_resume() {
            // There's no new request data available and the debugger has
            // already asked us to resume. OK, do that (or keep doing
            // that) now.
            return self.req;
        }

        loop {
            // There's either new request data, or we have nothing to do.
            // Either way, block until we read a complete packet from the
            // debugger.
            self.read_packet();

            if self.process_packet() {
                // We couldn't process the packet internally, so the
                // driver has to do something.
                return self.req;
            }
            // The packet we got was internal protocol detail; nothing for
            // the driver to do yet. Keep waiting.
        }
    }

    // -----------------------------------------------------------------
    // Notifications and replies
    // -----------------------------------------------------------------

    fn send_stop_reply_packet(
        &mut self,
        async_: bool,
        prefix: &str,
        thread: DbgThreadId,
        sig: i32,
    ) {
        if sig >= 0 {
            let buf = format!(
                "{}T{:02x}thread:{:02x};",
                prefix,
                to_gdb_signum(sig),
                thread
            );
            if async_ {
                self.write_async_packet(&buf);
            } else {
                self.write_packet(&buf);
            }
        } else {
            self.write_packet("E01");
        }
    }

    /// Notify the debugger that `thread` stopped with `sig`, as the
    /// async non-stop notification %Stop:T<sig>thread:<tid>;.
    pub fn notify_stop(&mut self, thread: DbgThreadId, sig: i32) {
        debug_assert!(self.non_stop);
        debug_assert!(self.req.is_resume() || self.req.type_ == Interrupt);

        self.send_stop_reply_packet(true, "Stop:", thread, sig);
        self.consume_request();
    }

    /// Notify the debugger that the tracee exited with `code`.
    pub fn notify_exit_code(&mut self, code: i32) {
        debug_assert!(self.req.is_resume() || self.req.type_ == Interrupt);

        let buf = format!("W{:02x}", code);
        self.write_packet(&buf);
        self.consume_request();
    }

    /// Notify the debugger that the tracee was terminated by `sig`.
    pub fn notify_exit_signal(&mut self, sig: i32) {
        debug_assert!(self.req.is_resume() || self.req.type_ == Interrupt);

        let buf = format!("X{:02x}", to_gdb_signum(sig));
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_invalid_target(&mut self) {
        self.write_packet("E00");
        self.consume_request();
    }

    pub fn reply_get_current_thread(&mut self, thread: DbgThreadId) {
        debug_assert_eq!(GetCurrentThread, self.req.type_);

        let buf = format!("QC{:02x}", thread);
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_get_is_thread_alive(&mut self, alive: bool) {
        debug_assert_eq!(GetIsThreadAlive, self.req.type_);

        self.write_packet(if alive { "OK" } else { "E01" });
        self.consume_request();
    }

    pub fn reply_select_thread(&mut self, ok: bool) {
        debug_assert!(
            self.req.type_ == SetContinueThread || self.req.type_ == SetQueryThread
        );

        if ok && self.req.type_ == SetContinueThread {
            self.resume_thread = self.req.target;
        } else if ok && self.req.type_ == SetQueryThread {
            self.query_thread = self.req.target;
        }
        self.write_packet(if ok { "OK" } else { "E01" });
        self.consume_request();
    }

    pub fn reply_get_mem(&mut self, mem: &[u8]) {
        debug_assert_eq!(GetMem, self.req.type_);
        debug_assert!(mem.len() <= self.req.mem_len);

        if !mem.is_empty() {
            self.write_hex_encoded_bytes(mem);
        } else {
            self.write_packet("");
        }
        self.consume_request();
    }

    pub fn reply_get_offsets(&mut self) {
        debug_assert_eq!(GetOffsets, self.req.type_);

        self.write_packet("");
        self.consume_request();
    }

    /// Format `value` the way the debugger expects: the register's bytes
    /// in target (little-endian) order as hex digits, or 'x' filler for
    /// an undefined register.
    fn print_reg(value: &DbgRegValue, out: &mut String) {
        if value.defined {
            for b in &value.value[..value.size] {
                out.push_str(&format!("{:02x}", b));
            }
        } else {
            for _ in 0..value.size {
                out.push_str("xx");
            }
        }
    }

    pub fn reply_get_reg(&mut self, value: &DbgRegValue) {
        debug_assert_eq!(GetReg, self.req.type_);

        let mut buf = String::new();
        Self::print_reg(value, &mut buf);
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_get_regs(&mut self, file: &[DbgRegValue]) {
        debug_assert_eq!(GetRegs, self.req.type_);

        let mut buf = String::new();
        for value in file {
            Self::print_reg(value, &mut buf);
        }
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_get_stop_reason(&mut self, which: DbgThreadId, sig: i32) {
        debug_assert_eq!(GetStopReason, self.req.type_);

        self.send_stop_reply_packet(false, "", which, sig);
        self.consume_request();
    }

    pub fn reply_get_thread_list(&mut self, threads: &[DbgThreadId]) {
        debug_assert_eq!(GetThreadList, self.req.type_);

        if threads.is_empty() {
            self.write_packet("l");
        } else {
            let mut buf = String::from("m");
            for (i, thread) in threads.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&format!("{:02x}", thread));
            }
            self.write_packet(&buf);
        }
        self.consume_request();
    }

    pub fn reply_watchpoint_request(&mut self, code: i32) {
        debug_assert!(self.req.is_watch_request());

        self.write_packet(if code != 0 { "" } else { "OK" });
        self.consume_request();
    }

    pub fn request(&self) -> &DbgRequest {
        &self.req
    }

    pub fn serving_symbol_lookups(&self) -> bool {
        self.serving_symbol_lookups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::socketpair;

    fn pair() -> (GdbConnection, RawFd) {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            Option::<nix::sys::socket::SockProtocol>::None,
            SockFlag::empty(),
        )
        .unwrap();
        (GdbConnection::from_fd(ours), theirs)
    }

    fn send(fd: RawFd, payload: &str) {
        let pkt = format!("${}#{:02x}", payload, packet_checksum(payload.as_bytes()));
        write(fd, pkt.as_bytes()).unwrap();
    }

    fn drain(fd: RawFd) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        match read(fd, &mut buf) {
            Ok(n) => buf[..n].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    fn packet_bytes(payload: &str) -> Vec<u8> {
        format!("${}#{:02x}", payload, packet_checksum(payload.as_bytes())).into_bytes()
    }

    fn negotiate_non_stop(dbg: &mut GdbConnection, them: RawFd) {
        send(them, "QNonStop:1");
        dbg.read_packet();
        assert!(!dbg.process_packet());
        drain(them);
    }

    #[test]
    fn supported_handshake() {
        let (mut dbg, them) = pair();
        send(them, "qSupported:multiprocess+");
        dbg.read_packet();
        let to_driver = dbg.process_packet();
        assert!(!to_driver);

        let mut expected = b"+".to_vec();
        expected.extend(packet_bytes("QStartNoAckMode+;QNonStop+"));
        expected.extend(packet_bytes("QNonStop+"));
        assert_eq!(expected, drain(them));
    }

    #[test]
    fn no_ack_mode_suppresses_acks() {
        let (mut dbg, them) = pair();
        send(them, "QStartNoAckMode");
        dbg.read_packet();
        assert!(!dbg.process_packet());
        let mut expected = b"+".to_vec();
        expected.extend(b"$OK#9a".iter());
        assert_eq!(expected, drain(them));

        // Subsequent packets must not be acked.
        send(them, "qTStatus");
        dbg.read_packet();
        assert!(!dbg.process_packet());
        assert_eq!(packet_bytes(""), drain(them));
    }

    #[test]
    fn non_stop_continue_then_stop_notification() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "vCont;c");
        dbg.read_packet();
        let to_driver = dbg.process_packet();
        assert!(to_driver);
        assert_eq!(Continue, dbg.request().type_);

        dbg.notify_stop(0x42, libc::SIGTRAP);
        let bytes = drain(them);
        let text = String::from_utf8_lossy(&bytes);
        assert!(
            text.contains("%Stop:T05thread:42;#"),
            "unexpected wire bytes {}",
            text
        );
    }

    #[test]
    fn step_with_explicit_thread() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "vCont;s:42");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(Step, dbg.request().type_);
        assert_eq!(0x42, dbg.request().target);
    }

    #[test]
    fn memory_read_request_and_reply() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "m70001000,10");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(GetMem, dbg.request().type_);
        assert_eq!(0x70001000, dbg.request().mem_addr);
        assert_eq!(0x10, dbg.request().mem_len);
        drain(them);

        dbg.reply_get_mem(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(packet_bytes("deadbeef"), drain(them));
    }

    #[test]
    fn memory_writes_are_refused() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "M70001000,4:deadbeef");
        dbg.read_packet();
        assert!(!dbg.process_packet());
        let mut expected = b"+".to_vec();
        expected.extend(packet_bytes(""));
        assert_eq!(expected, drain(them));
    }

    #[test]
    fn register_encoding_little_endian_and_undefined() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "p10");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(GetReg, dbg.request().type_);
        assert_eq!(0x10, dbg.request().reg);
        drain(them);

        let mut value = [0u8; MAX_REG_SIZE_BYTES];
        value[..8].copy_from_slice(&0x1122334455667788u64.to_le_bytes());
        dbg.reply_get_reg(&DbgRegValue {
            name: 0x10,
            value,
            size: 8,
            defined: true,
        });
        assert_eq!(packet_bytes("8877665544332211"), drain(them));

        send(them, "p11");
        dbg.read_packet();
        assert!(dbg.process_packet());
        drain(them);
        dbg.reply_get_reg(&DbgRegValue {
            name: 0x11,
            value: [0u8; MAX_REG_SIZE_BYTES],
            size: 4,
            defined: false,
        });
        assert_eq!(packet_bytes("xxxxxxxx"), drain(them));
    }

    #[test]
    fn watchpoint_request_parsing() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "Z2,70002000,8");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(SetWrWatch, dbg.request().type_);
        assert_eq!(0x70002000, dbg.request().mem_addr);
        assert_eq!(8, dbg.request().mem_len);
        drain(them);
        dbg.reply_watchpoint_request(0);
        assert_eq!(packet_bytes("OK"), drain(them));

        send(them, "z0,70002000,1");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(RemoveSwBreak, dbg.request().type_);
    }

    #[test]
    fn interrupt_byte_is_a_request() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        write(them, &[INTERRUPT_CHAR]).unwrap();
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(Interrupt, dbg.request().type_);
    }

    #[test]
    fn thread_list_reply_formats() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "qfThreadInfo");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(GetThreadList, dbg.request().type_);
        drain(them);
        dbg.reply_get_thread_list(&[0x11, 0x2a]);
        assert_eq!(packet_bytes("m11,2a"), drain(them));
    }

    #[test]
    fn exit_code_notification() {
        let (mut dbg, them) = pair();
        negotiate_non_stop(&mut dbg, them);

        send(them, "vCont;c");
        dbg.read_packet();
        assert!(dbg.process_packet());
        // The "OK" for the resume request is written but sits buffered
        // until the next flush.
        assert_eq!(b"+".to_vec(), drain(them));
        dbg.notify_exit_code(3);
        let mut expected = packet_bytes("OK");
        expected.extend(packet_bytes("W03"));
        assert_eq!(expected, drain(them));
    }

    #[test]
    fn select_thread_updates_resume_thread() {
        let (mut dbg, them) = pair();

        send(them, "Hc42");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(SetContinueThread, dbg.request().type_);
        assert_eq!(0x42, dbg.request().target);
        dbg.reply_select_thread(true);
        drain(them);

        // A later vCont;c resumes the selected thread.
        negotiate_non_stop(&mut dbg, them);
        send(them, "vCont;c");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(0x42, dbg.request().target);
    }

    #[test]
    fn gdb_signal_translation_table() {
        assert_eq!(5, to_gdb_signum(libc::SIGTRAP));
        assert_eq!(11, to_gdb_signum(libc::SIGSEGV));
        assert_eq!(38, to_gdb_signum(libc::SIGSTKFLT));
        assert_eq!(12, to_gdb_signum(libc::SIGSYS));
        assert_eq!(20, to_gdb_signum(libc::SIGCHLD));
        // Realtime signals map with an offset of 12.
        assert_eq!(libc::SIGRTMIN() + 12, to_gdb_signum(libc::SIGRTMIN()));
        // Every classic signal has a translation.
        for sig in 1..=31 {
            assert!(to_gdb_signum(sig) > 0);
        }
    }

    #[test]
    fn checksum_arithmetic() {
        assert_eq!(0, packet_checksum(b""));
        assert_eq!(b'O'.wrapping_add(b'K'), packet_checksum(b"OK"));
        // "OK" checksums to 0x9a, the canonical handshake value.
        assert_eq!(0x9a, packet_checksum(b"OK"));
    }
}
