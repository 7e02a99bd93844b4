//! Devices implementing the bus contract.
//!
//! Drivers are looked up in a compile-time registry keyed by the `driver`
//! string of a `[device-N]` section; an unknown identifier is a
//! configuration error. Host-facing transports are modelled as
//! [`InputSource`] and [`OutputSink`] capabilities that the terminal wiring
//! plugs into keyboard and tty instances at boot.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

use crate::bus::Device;
use crate::config::DeviceSection;
use crate::trap::VmError;

pub mod block;
pub mod keyboard;
pub mod rtc;
pub mod snapshot_dev;
pub mod svga;
pub mod terminal;
pub mod tty;

pub use block::BlockDevice;
pub use keyboard::Keyboard;
pub use rtc::Rtc;
pub use snapshot_dev::SnapshotDevice;
pub use svga::Svga;
pub use terminal::{StdinReader, Terminal};
pub use tty::Tty;

/// Shared capture buffer for guest console output.
pub type CaptureBuffer = Rc<RefCell<Vec<u8>>>;

/// Where a device sends host-bound bytes.
#[derive(Debug, Default)]
pub enum OutputSink {
    #[default]
    Null,
    Stdout,
    Stderr,
    Capture(CaptureBuffer),
    /// Forward to stdout and keep a copy, for `-g` runs.
    StdoutCapture(CaptureBuffer),
}

impl OutputSink {
    pub fn write_byte(&mut self, byte: u8) {
        self.write_all(&[byte]);
    }

    pub fn write_all(&mut self, bytes: &[u8]) {
        match self {
            OutputSink::Null => {}
            OutputSink::Stdout => {
                let mut out = std::io::stdout();
                let _ = out.write_all(bytes);
                let _ = out.flush();
            }
            OutputSink::Stderr => {
                let mut err = std::io::stderr();
                let _ = err.write_all(bytes);
                let _ = err.flush();
            }
            OutputSink::Capture(buffer) => buffer.borrow_mut().extend_from_slice(bytes),
            OutputSink::StdoutCapture(buffer) => {
                let mut out = std::io::stdout();
                let _ = out.write_all(bytes);
                let _ = out.flush();
                buffer.borrow_mut().extend_from_slice(bytes);
            }
        }
    }
}

/// Where a device obtains host-originated bytes.
#[derive(Debug, Default)]
pub enum InputSource {
    #[default]
    Null,
    Queue(VecDeque<u8>),
    Stdin(StdinReader),
}

impl InputSource {
    /// Drain whatever the host has ready right now.
    pub fn poll(&mut self, out: &mut VecDeque<u8>) {
        match self {
            InputSource::Null => {}
            InputSource::Queue(queue) => out.extend(queue.drain(..)),
            InputSource::Stdin(reader) => reader.poll(out),
        }
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        match self {
            InputSource::Null => None,
            InputSource::Queue(queue) => queue.pop_front(),
            InputSource::Stdin(reader) => reader.read_byte(),
        }
    }
}

/// A constructed device plus the bus regions it wants.
pub struct DeviceSetup {
    pub device: Box<dyn Device>,
    pub mmio: Option<(u32, u32)>,
    pub ports: Option<(u16, u16)>,
}

fn mmio_base(section: &DeviceSection) -> Result<u32, VmError> {
    section.mmio_base.ok_or_else(|| {
        VmError::Configuration(format!("device {} needs mmio-base", section.name))
    })
}

/// Construct a device from its configuration section. The registry is
/// compile time; an unknown driver is a configuration error.
pub fn construct(section: &DeviceSection) -> Result<DeviceSetup, VmError> {
    match section.driver.as_str() {
        "rtc" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, rtc::MMIO_SIZE)),
            ports: None,
            device: Box::new(Rtc::from_config(section)),
        }),
        "keyboard" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, keyboard::MMIO_SIZE)),
            ports: None,
            device: Box::new(Keyboard::from_config(section)),
        }),
        "tty" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, tty::MMIO_SIZE)),
            ports: None,
            device: Box::new(Tty::from_config(section)),
        }),
        "terminal" => Ok(DeviceSetup {
            mmio: None,
            ports: Some((crate::bus::CONIO_STDIN, 2)),
            device: Box::new(Terminal::from_config(section)),
        }),
        "block" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, block::MMIO_SIZE)),
            ports: None,
            device: Box::new(BlockDevice::from_config(section)?),
        }),
        "snapshot" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, snapshot_dev::MMIO_SIZE)),
            ports: None,
            device: Box::new(SnapshotDevice::from_config(section)?),
        }),
        "svga" => Ok(DeviceSetup {
            mmio: Some((mmio_base(section)?, svga::MMIO_SIZE)),
            ports: None,
            device: Box::new(Svga::from_config(section)),
        }),
        other => Err(VmError::Configuration(format!(
            "device {}: unknown driver {other:?}",
            section.name
        ))),
    }
}
