// Test harness: a spawned jdwp-sim process and a minimal blocking debugger

#![allow(dead_code)]

use bytes::BufMut;
use jdwp_agent::commands::{command_sets, event_commands, modifier_kinds, thread_commands, vm_commands};
use jdwp_agent::events::{parse_event_packet, EventSet};
use jdwp_agent::protocol::{CommandPacket, Packet, ReplyPacket, JDWP_HANDSHAKE};
use jdwp_agent::reader::{put_location, read_i32, read_location, read_u64};
use jdwp_agent::types::{type_tags, Location, ThreadId};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub const COUNTER_CLASS: u64 = 0x100;
pub const RUN_METHOD: u64 = 0x200;
pub const TICK_METHOD: u64 = 0x201;
pub const ADD_METHOD: u64 = 0x202;
pub const COUNTER_OBJECT: u64 = 0x5000;

pub const POLICY_NONE: u8 = 0;
pub const POLICY_EVENT_THREAD: u8 = 1;
pub const POLICY_ALL: u8 = 2;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn location(method: u64, index: u64) -> Location {
    Location {
        type_tag: type_tags::CLASS,
        class_id: COUNTER_CLASS,
        method_id: method,
        index,
    }
}

/// A running jdwp-sim, killed on drop
pub struct SimProcess {
    child: Child,
    _stdout: Option<BufReader<ChildStdout>>,
    pub port: u16,
}

impl SimProcess {
    pub fn spawn(args: &[&str]) -> Child {
        Command::new(env!("CARGO_BIN_EXE_jdwp-sim"))
            .args(args)
            .arg("--pace-ms")
            .arg("5")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn jdwp-sim")
    }

    /// Start listening on an ephemeral port and wait for the address line
    pub fn listen(suspend: bool, threads: usize) -> Self {
        let agent = format!(
            "transport=dt_socket,server=y,suspend={},address=127.0.0.1:0",
            if suspend { "y" } else { "n" }
        );
        let threads = threads.to_string();
        let mut child = Self::spawn(&["--agent", &agent, "--threads", &threads]);

        let mut stdout = BufReader::new(child.stdout.take().expect("stdout is piped"));
        let mut line = String::new();
        stdout.read_line(&mut line).expect("no address line");
        let port = line
            .trim()
            .rsplit(' ')
            .next()
            .and_then(|port| port.parse().ok())
            .unwrap_or_else(|| panic!("unexpected address line: {:?}", line));

        Self {
            child,
            _stdout: Some(stdout),
            port,
        }
    }

    pub fn from_child(child: Child) -> Self {
        Self {
            child,
            _stdout: None,
            port: 0,
        }
    }

    pub fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        wait_for_exit(&mut self.child, timeout)
    }
}

impl Drop for SimProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("try_wait failed") {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

/// Blocking debugger side of a JDWP connection
pub struct Debugger {
    stream: TcpStream,
    next_id: u32,
    events: VecDeque<EventSet>,
}

impl Debugger {
    pub fn connect(port: u16) -> Self {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return Self::handshake(stream),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("failed to connect: {}", e),
            }
        }
    }

    /// The debugger speaks first
    pub fn handshake(mut stream: TcpStream) -> Self {
        stream.set_nodelay(true).unwrap();
        stream.write_all(JDWP_HANDSHAKE).unwrap();
        let mut reply = [0u8; 14];
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[..], JDWP_HANDSHAKE);

        Self {
            stream,
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    fn read_packet(&mut self, timeout: Duration) -> Option<Packet> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let mut length = [0u8; 4];
        match self.stream.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return None,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return None,
            Err(e) => panic!("read failed: {}", e),
        }

        let total = u32::from_be_bytes(length) as usize;
        let mut frame = length.to_vec();
        frame.resize(total, 0);
        self.stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        self.stream.read_exact(&mut frame[4..]).unwrap();
        Some(Packet::decode(&frame).unwrap())
    }

    fn queue_event(&mut self, command: CommandPacket) {
        assert_eq!(command.command_set, command_sets::EVENT);
        self.events.push_back(parse_event_packet(&command.data).unwrap());
    }

    pub fn send(&mut self, command_set: u8, command: u8, data: Vec<u8>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let packet = CommandPacket::with_data(id, command_set, command, data);
        self.stream.write_all(&packet.encode()).unwrap();
        id
    }

    /// Send a command and wait for its reply, queueing events seen meanwhile
    pub fn command(&mut self, command_set: u8, command: u8, data: Vec<u8>) -> ReplyPacket {
        let id = self.send(command_set, command, data);
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            match self.read_packet(TIMEOUT) {
                Some(Packet::Reply(reply)) if reply.id == id => return reply,
                Some(Packet::Reply(reply)) => panic!("unexpected reply {}", reply.id),
                Some(Packet::Command(command)) => self.queue_event(command),
                None => break,
            }
        }
        panic!("no reply to command {}/{}", command_set, command);
    }

    pub fn next_event(&mut self, timeout: Duration) -> Option<EventSet> {
        if let Some(events) = self.events.pop_front() {
            return Some(events);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.read_packet(remaining)? {
                Packet::Command(command) => {
                    self.queue_event(command);
                    return self.events.pop_front();
                }
                Packet::Reply(reply) => panic!("unexpected reply {}", reply.id),
            }
        }
    }

    pub fn expect_event(&mut self) -> EventSet {
        self.next_event(TIMEOUT).expect("no event arrived")
    }

    fn ok(reply: ReplyPacket) -> ReplyPacket {
        assert_eq!(reply.error_code, 0, "command failed: {}", reply.error_message());
        reply
    }

    pub fn set_request(&mut self, event_kind: u8, policy: u8, modifiers: &[Vec<u8>]) -> i32 {
        let mut data = Vec::new();
        data.put_u8(event_kind);
        data.put_u8(policy);
        data.put_i32(modifiers.len() as i32);
        for modifier in modifiers {
            data.put_slice(modifier);
        }
        let reply = Self::ok(self.command(command_sets::EVENT_REQUEST, event_commands::SET, data));
        read_i32(&mut reply.data()).unwrap()
    }

    pub fn set_breakpoint(&mut self, at: Location, policy: u8) -> i32 {
        let mut modifier = vec![modifier_kinds::LOCATION_ONLY];
        put_location(&mut modifier, &at);
        self.set_request(jdwp_agent::commands::event_kinds::BREAKPOINT, policy, &[modifier])
    }

    pub fn set_step(&mut self, thread: ThreadId, size: i32, depth: i32, policy: u8) -> i32 {
        let mut modifier = vec![modifier_kinds::STEP];
        modifier.put_u64(thread);
        modifier.put_i32(size);
        modifier.put_i32(depth);
        self.set_request(jdwp_agent::commands::event_kinds::SINGLE_STEP, policy, &[modifier])
    }

    pub fn clear(&mut self, event_kind: u8, request_id: i32) {
        let mut data = Vec::new();
        data.put_u8(event_kind);
        data.put_i32(request_id);
        Self::ok(self.command(command_sets::EVENT_REQUEST, event_commands::CLEAR, data));
    }

    pub fn resume_vm(&mut self) {
        Self::ok(self.command(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, Vec::new()));
    }

    pub fn resume_thread(&mut self, thread: ThreadId) {
        let mut data = Vec::new();
        data.put_u64(thread);
        Self::ok(self.command(command_sets::THREAD_REFERENCE, thread_commands::RESUME, data));
    }

    pub fn all_threads(&mut self) -> Vec<ThreadId> {
        let reply = Self::ok(self.command(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS, Vec::new()));
        let mut buf = reply.data();
        let count = read_i32(&mut buf).unwrap();
        (0..count).map(|_| read_u64(&mut buf).unwrap()).collect()
    }

    pub fn suspend_count(&mut self, thread: ThreadId) -> i32 {
        let mut data = Vec::new();
        data.put_u64(thread);
        let reply = Self::ok(self.command(command_sets::THREAD_REFERENCE, thread_commands::SUSPEND_COUNT, data));
        read_i32(&mut reply.data()).unwrap()
    }

    pub fn frames(&mut self, thread: ThreadId) -> Vec<(u64, Location)> {
        let mut data = Vec::new();
        data.put_u64(thread);
        data.put_i32(0);
        data.put_i32(-1);
        let reply = Self::ok(self.command(command_sets::THREAD_REFERENCE, thread_commands::FRAMES, data));
        let mut buf = reply.data();
        let count = read_i32(&mut buf).unwrap();
        (0..count)
            .map(|_| {
                let frame = read_u64(&mut buf).unwrap();
                (frame, read_location(&mut buf).unwrap())
            })
            .collect()
    }
}
