//! Terminal: the bridge between guest console devices and the host tty.
//!
//! The terminal fills two roles. As a bus device it serves the legacy
//! console I/O ports (stdin/stdout/stderr). As configuration it names the
//! keyboard and tty instances whose input source and output sink the machine
//! wires to the host streams at boot; when an `input` binding exists the
//! bound keyboard owns host stdin and the port-side input stays silent.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{stdin, Read};
use std::os::unix::io::AsRawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::bus::{Device, DeviceCtx, DeviceInfo, Width};
use crate::config::DeviceSection;
use crate::devices::{InputSource, OutputSink};
use crate::trap::{Access, Trap};

pub const PORT_STDIO: u16 = 0x0;
pub const PORT_STDERR: u16 = 0x1;

/// Non-blocking reader over host stdin.
#[derive(Debug)]
pub struct StdinReader {
    nonblocking: bool,
}

impl StdinReader {
    pub fn new() -> Self {
        let fd = stdin().as_raw_fd();
        let nonblocking = fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).is_ok();
        if !nonblocking {
            tracing::warn!("stdin cannot be made non-blocking, console input disabled");
        }
        StdinReader { nonblocking }
    }

    pub fn poll(&mut self, out: &mut VecDeque<u8>) {
        if !self.nonblocking {
            return;
        }
        let mut buf = [0u8; 64];
        // EAGAIN (or any error) just means nothing is ready.
        if let Ok(n) = stdin().lock().read(&mut buf) {
            out.extend(&buf[..n]);
        }
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let mut queue = VecDeque::new();
        self.poll(&mut queue);
        queue.pop_front()
    }
}

impl Default for StdinReader {
    fn default() -> Self {
        StdinReader::new()
    }
}

#[derive(Debug)]
pub struct Terminal {
    name: String,
    /// Keyboard instance bound to host stdin, if any.
    pub input: Option<String>,
    /// Tty instance bound to host stdout, if any.
    pub output: Option<String>,
    source: InputSource,
    sink: OutputSink,
    err_sink: OutputSink,
}

impl Terminal {
    pub fn from_config(section: &DeviceSection) -> Self {
        Terminal {
            name: section.name.clone(),
            input: section.str_key("input").map(str::to_owned),
            output: section.str_key("output").map(str::to_owned),
            source: InputSource::Null,
            sink: OutputSink::Null,
            err_sink: OutputSink::Stderr,
        }
    }

    pub fn set_source(&mut self, source: InputSource) {
        self.source = source;
    }

    pub fn set_sink(&mut self, sink: OutputSink) {
        self.sink = sink;
    }
}

impl Device for Terminal {
    fn class(&self) -> &'static str {
        "terminal"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "term".into(),
            ident: "ducky.terminal".into(),
            flags: 0,
        }
    }

    fn mmio_read(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
    ) -> Result<u32, Trap> {
        Err(Trap::AccessViolation {
            addr: offset,
            access: Access::Read,
        })
    }

    fn mmio_write(
        &mut self,
        _ctx: &mut DeviceCtx<'_>,
        offset: u32,
        _width: Width,
        _value: u32,
    ) -> Result<(), Trap> {
        Err(Trap::AccessViolation {
            addr: offset,
            access: Access::Write,
        })
    }

    fn io_read(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u16) -> Result<u8, Trap> {
        match offset {
            PORT_STDIO => Ok(self.source.read_byte().unwrap_or(0)),
            _ => Err(Trap::AccessViolation {
                addr: u32::from(offset),
                access: Access::Read,
            }),
        }
    }

    fn io_write(&mut self, _ctx: &mut DeviceCtx<'_>, offset: u16, value: u8) -> Result<(), Trap> {
        match offset {
            PORT_STDIO => {
                self.sink.write_byte(value);
                Ok(())
            }
            PORT_STDERR => {
                self.err_sink.write_byte(value);
                Ok(())
            }
            _ => Err(Trap::AccessViolation {
                addr: u32::from(offset),
                access: Access::Write,
            }),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
