// src/io/serial/mock.rs
//
// In-memory serial devices for tests.
// A `MockDevice` is shared between the test (which feeds inbound bytes and
// inspects what was written) and the `MockLink` the worker reads from.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::link::{PortOpener, SerialLink};
use crate::io::SerialError;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    write_calls: usize,
    removed: bool,
    fail_writes: bool,
    /// Simulated time on the wire per byte, paid in `flush`
    drain_per_byte: Duration,
    undrained: usize,
    open: bool,
    opens: usize,
}

/// A fake device. Clones share state.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by a future read
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state.lock().unwrap().inbound.push_back(bytes.to_vec());
    }

    /// Everything written to the device so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    /// Simulate the device being unplugged: reads and writes fail from now on
    pub fn unplug(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Make writes fail while reads keep working
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Make `flush` block for `per_byte` for every byte written since the
    /// last flush, like tcdrain on a slow line
    pub fn drain_per_byte(&self, per_byte: Duration) {
        self.state.lock().unwrap().drain_per_byte = per_byte;
    }

    /// Whether a link to this device is currently held
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }
}

/// The worker-side handle to a `MockDevice`
pub struct MockLink {
    device: MockDevice,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.state.lock().unwrap();
        if state.removed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device removed"));
        }
        let next = state.inbound.pop_front();
        match next {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.inbound.push_front(chunk.split_off(n));
                }
                Ok(n)
            }
            None => {
                drop(state);
                std::thread::sleep(Duration::from_millis(1));
                Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"))
            }
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.state.lock().unwrap();
        state.write_calls += 1;
        if state.removed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device removed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "write rejected"));
        }
        state.written.extend_from_slice(buf);
        state.undrained += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let delay = {
            let mut state = self.device.state.lock().unwrap();
            let delay = state.drain_per_byte * state.undrained as u32;
            state.undrained = 0;
            delay
        };
        std::thread::sleep(delay);
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.device.state.lock().unwrap().open = false;
    }
}

/// Opens `MockDevice`s by name. Unknown names fail like a missing device,
/// and a device that is already open fails like a busy one.
#[derive(Clone, Default)]
pub struct MockPorts {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `name` and return a handle to it
    pub fn add(&self, name: &str) -> MockDevice {
        let device = MockDevice::new();
        self.devices
            .lock()
            .unwrap()
            .insert(name.to_string(), device.clone());
        device
    }
}

impl PortOpener for MockPorts {
    fn open(&self, port_name: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, SerialError> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(port_name)
            .ok_or_else(|| SerialError::connection(port_name, "No such file or directory"))?;

        let mut state = device.state.lock().unwrap();
        if state.removed {
            return Err(SerialError::connection(port_name, "No such file or directory"));
        }
        if state.open {
            return Err(SerialError::connection(port_name, "Device or resource busy"));
        }
        state.open = true;
        state.opens += 1;
        drop(state);

        Ok(Box::new(MockLink {
            device: device.clone(),
        }))
    }
}
