// src/io/serial/worker.rs
//
// Serial worker: owns one open connection and a dedicated read thread.
//
// The read thread is the only owner of the device handle. It forwards every
// successful read as a `WorkerEvent::Data` and services outbound writes from a
// bounded transmit queue between reads. Reads use a short timeout so a stop
// request is seen within one poll interval.

use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::link::{PortOpener, SerialLink, SystemPorts};
use crate::io::SerialError;

/// Base wait for the read thread to report a write result, on top of the
/// time the bytes need on the wire
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// Start + 8 data + stop
const BITS_PER_BYTE: u64 = 10;
const TRANSMIT_QUEUE_DEPTH: usize = 32;
const READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Port and baud rate of the open connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub port: String,
    pub baud_rate: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called
    Closed,
    /// The device failed or vanished mid-session
    Unexpected(String),
}

/// Events produced by the read thread, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One read's worth of bytes. `seq` increases by one per event.
    Data { seq: u64, bytes: Vec<u8> },
    /// Terminal event of a connection; nothing follows until the next `open`
    Disconnected { port: String, reason: DisconnectReason },
}

pub type EventSender = std_mpsc::Sender<WorkerEvent>;

/// Transmit request sent to the read thread
struct TransmitRequest {
    data: Vec<u8>,
    /// Sync oneshot channel to send the result back
    result_tx: std_mpsc::SyncSender<std::io::Result<()>>,
}

/// Counts live read loops. `peak` is the highest count ever observed.
#[derive(Debug, Default)]
pub struct ActivityGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityGauge {
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ActivityGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActivityGuard(self.clone())
    }
}

struct ActivityGuard(Arc<ActivityGauge>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Connection {
    info: ConnectionInfo,
    cancel_flag: Arc<AtomicBool>,
    /// Cleared by the read thread before it emits its terminal event
    running: Arc<AtomicBool>,
    transmit_tx: std_mpsc::SyncSender<TransmitRequest>,
    reader: JoinHandle<()>,
}

// ============================================================================
// Transmitter
// ============================================================================

/// Sending side of one connection. Cloned out of the worker so a caller can
/// wait for a write without holding whatever lock guards the worker.
#[derive(Clone)]
pub struct Transmitter {
    port: String,
    baud_rate: u32,
    transmit_tx: std_mpsc::SyncSender<TransmitRequest>,
}

impl Transmitter {
    /// Queue `data` for the read thread and wait for the write to drain.
    pub fn send(&self, data: &[u8]) -> Result<usize, SerialError> {
        if data.is_empty() {
            return Ok(0);
        }

        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        self.transmit_tx
            .try_send(TransmitRequest {
                data: data.to_vec(),
                result_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => SerialError::write("transmit queue is full"),
                TrySendError::Disconnected(_) => SerialError::write("connection closed"),
            })?;

        let timeout = write_timeout(data.len(), self.baud_rate);
        let result = result_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SerialError::write("timed out waiting for the device"),
            RecvTimeoutError::Disconnected => SerialError::write("connection closed"),
        })?;
        result.map_err(|e| SerialError::write(e.to_string()))?;

        tlog!(
            "[serial:{}] tx {} bytes: {}",
            self.port,
            data.len(),
            hex::encode(data)
        );
        Ok(data.len())
    }
}

/// How long a write of `len` bytes may take: the base allowance plus the
/// time to clock the bytes out at `baud_rate` (10 bits per byte at 8N1).
pub(crate) fn write_timeout(len: usize, baud_rate: u32) -> Duration {
    let wire_ms = (len as u64 * BITS_PER_BYTE * 1000) / u64::from(baud_rate.max(1));
    WRITE_TIMEOUT + Duration::from_millis(wire_ms)
}

// ============================================================================
// Serial Worker
// ============================================================================

/// Owns at most one open connection and its read thread
pub struct SerialWorker<O: PortOpener = SystemPorts> {
    opener: O,
    events: EventSender,
    connection: Option<Connection>,
    next_seq: Arc<AtomicU64>,
    activity: Arc<ActivityGauge>,
}

impl<O: PortOpener> SerialWorker<O> {
    pub fn new(opener: O, events: EventSender) -> Self {
        Self {
            opener,
            events,
            connection: None,
            next_seq: Arc::new(AtomicU64::new(0)),
            activity: Arc::new(ActivityGauge::default()),
        }
    }

    pub fn state(&mut self) -> ConnectionState {
        self.reap();
        if self.connection.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&mut self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connection_info(&mut self) -> Option<ConnectionInfo> {
        self.reap();
        self.connection.as_ref().map(|c| c.info.clone())
    }

    pub fn activity(&self) -> Arc<ActivityGauge> {
        self.activity.clone()
    }

    /// Open `port_name` at `baud_rate` and start the read thread.
    pub fn open(&mut self, port_name: &str, baud_rate: u32) -> Result<(), SerialError> {
        self.reap();
        if let Some(conn) = &self.connection {
            return Err(SerialError::AlreadyConnected {
                port: conn.info.port.clone(),
            });
        }
        if baud_rate == 0 {
            return Err(SerialError::connection(port_name, "invalid baud rate 0"));
        }

        let link = self.opener.open(port_name, baud_rate).map_err(|e| {
            tlog!("[serial] {}", e);
            e
        })?;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);

        let read_loop = ReadLoop {
            port: port_name.to_string(),
            link,
            events: self.events.clone(),
            cancel_flag: cancel_flag.clone(),
            running: running.clone(),
            transmit_rx,
            next_seq: self.next_seq.clone(),
            activity: self.activity.clone(),
        };

        let reader = thread::Builder::new()
            .name(format!("serial-reader {}", port_name))
            .spawn(move || read_loop.run())
            .map_err(|e| SerialError::connection(port_name, format!("failed to start reader: {}", e)))?;

        tlog!("[serial] Opened {} at {} baud (8-N-1)", port_name, baud_rate);

        self.connection = Some(Connection {
            info: ConnectionInfo {
                port: port_name.to_string(),
                baud_rate,
            },
            cancel_flag,
            running,
            transmit_tx,
            reader,
        });
        Ok(())
    }

    /// Stop the read thread and release the device. No-op when disconnected.
    ///
    /// Returns once the read thread has exited and dropped the device handle.
    pub fn close(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        let Connection {
            info,
            cancel_flag,
            transmit_tx,
            reader,
            ..
        } = conn;

        cancel_flag.store(true, Ordering::SeqCst);
        drop(transmit_tx);
        if reader.join().is_err() {
            tlog!("[serial] Reader thread for {} panicked", info.port);
        }
        tlog!("[serial] Closed {}", info.port);
    }

    /// Handle for writing to the open connection without borrowing the worker
    pub fn transmitter(&mut self) -> Result<Transmitter, SerialError> {
        self.reap();
        let conn = self.connection.as_ref().ok_or(SerialError::NotConnected)?;
        Ok(Transmitter {
            port: conn.info.port.clone(),
            baud_rate: conn.info.baud_rate,
            transmit_tx: conn.transmit_tx.clone(),
        })
    }

    /// Join a read thread that ended on its own (device error)
    fn reap(&mut self) {
        let finished = self
            .connection
            .as_ref()
            .map(|c| !c.running.load(Ordering::SeqCst))
            .unwrap_or(false);
        if !finished {
            return;
        }
        if let Some(conn) = self.connection.take() {
            if conn.reader.join().is_err() {
                tlog!("[serial] Reader thread for {} panicked", conn.info.port);
            }
        }
    }
}

impl<O: PortOpener> Drop for SerialWorker<O> {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Read Loop
// ============================================================================

struct ReadLoop {
    port: String,
    link: Box<dyn SerialLink>,
    events: EventSender,
    cancel_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    next_seq: Arc<AtomicU64>,
    activity: Arc<ActivityGauge>,
}

impl ReadLoop {
    fn run(mut self) {
        let _active = self.activity.enter();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        let reason = loop {
            if self.cancel_flag.load(Ordering::SeqCst) {
                break DisconnectReason::Closed;
            }

            // Process pending transmit requests (non-blocking)
            while let Ok(req) = self.transmit_rx.try_recv() {
                let result = self
                    .link
                    .write_all(&req.data)
                    .and_then(|_| self.link.flush());
                if let Err(ref e) = result {
                    tlog!("[serial:{}] Write error: {}", self.port, e);
                }
                let _ = req.result_tx.try_send(result);
            }

            match self.link.read(&mut buf) {
                Ok(0) => {
                    // EOF - port closed/disconnected
                    break DisconnectReason::Unexpected("device closed the connection".to_string());
                }
                Ok(n) => {
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(WorkerEvent::Data {
                        seq,
                        bytes: buf[..n].to_vec(),
                    });
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    // Timeout is expected for serial reads
                }
                Err(e) => {
                    tlog!("[serial:{}] Read error: {}", self.port, e);
                    break DisconnectReason::Unexpected(e.to_string());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(WorkerEvent::Disconnected {
            port: self.port.clone(),
            reason,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::mock::MockPorts;
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    const PORT: &str = "/dev/ttyMOCK0";

    fn worker_with_device() -> (SerialWorker<MockPorts>, Receiver<WorkerEvent>, crate::io::serial::mock::MockDevice) {
        let ports = MockPorts::new();
        let device = ports.add(PORT);
        let (tx, rx) = std_mpsc::channel();
        (SerialWorker::new(ports, tx), rx, device)
    }

    fn send(worker: &mut SerialWorker<MockPorts>, data: &[u8]) -> Result<usize, SerialError> {
        worker.transmitter()?.send(data)
    }

    fn next_event(rx: &Receiver<WorkerEvent>) -> WorkerEvent {
        rx.recv_timeout(Duration::from_secs(2))
            .expect("timed out waiting for a worker event")
    }

    /// Collect events until none arrive for `quiet`
    fn drain(rx: &Receiver<WorkerEvent>, quiet: Duration) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(quiet) {
            events.push(event);
        }
        events
    }

    fn wait_for_disconnect(rx: &Receiver<WorkerEvent>) -> DisconnectReason {
        loop {
            if let WorkerEvent::Disconnected { reason, .. } = next_event(rx) {
                return reason;
            }
        }
    }

    #[test]
    fn test_received_bytes_arrive_in_order_without_loss() {
        let (mut worker, rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let chunk: Vec<u8> = (0..(i % 17 + 1)).map(|j| (i * 31 + j) as u8).collect();
            device.push_inbound(&chunk);
            expected.extend_from_slice(&chunk);
        }
        // A chunk larger than the read buffer is split across reads
        let big: Vec<u8> = (0..READ_BUFFER_SIZE * 2 + 5).map(|i| (i % 251) as u8).collect();
        device.push_inbound(&big);
        expected.extend_from_slice(&big);

        let mut received = Vec::new();
        let mut last_seq: Option<u64> = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < expected.len() && Instant::now() < deadline {
            match next_event(&rx) {
                WorkerEvent::Data { seq, bytes } => {
                    if let Some(prev) = last_seq {
                        assert_eq!(seq, prev + 1);
                    }
                    last_seq = Some(seq);
                    received.extend_from_slice(&bytes);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert_eq!(received, expected);
        worker.close();
    }

    #[test]
    fn test_send_while_disconnected_does_no_io() {
        let (mut worker, _rx, device) = worker_with_device();
        assert_eq!(send(&mut worker, b"AT\r\n"), Err(SerialError::NotConnected));
        assert_eq!(device.write_calls(), 0);
        assert_eq!(device.open_count(), 0);
    }

    #[test]
    fn test_send_writes_exact_bytes() {
        let (mut worker, _rx, device) = worker_with_device();
        worker.open(PORT, 9600).unwrap();

        assert_eq!(send(&mut worker, b"AT\r\n"), Ok(4));
        assert_eq!(send(&mut worker, b"ATI\n"), Ok(4));
        assert_eq!(device.written(), b"AT\r\nATI\n".to_vec());
        worker.close();
    }

    #[test]
    fn test_open_missing_device_fails() {
        let (mut worker, _rx, _device) = worker_with_device();
        let err = worker.open("/dev/ttyNOPE", 115200).unwrap_err();
        assert!(matches!(err, SerialError::Connection { ref port, .. } if port == "/dev/ttyNOPE"));
        assert_eq!(worker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_open_busy_device_fails() {
        let ports = MockPorts::new();
        ports.add(PORT);
        let (tx, _rx) = std_mpsc::channel();
        let mut first = SerialWorker::new(ports.clone(), tx.clone());
        let mut second = SerialWorker::new(ports, tx);

        first.open(PORT, 115200).unwrap();
        let err = second.open(PORT, 115200).unwrap_err();
        assert_eq!(err, SerialError::connection(PORT, "Device or resource busy"));
        assert!(!second.is_connected());
        first.close();
    }

    #[test]
    fn test_invalid_baud_rejected() {
        let (mut worker, _rx, device) = worker_with_device();
        assert!(matches!(
            worker.open(PORT, 0),
            Err(SerialError::Connection { .. })
        ));
        assert_eq!(device.open_count(), 0);
    }

    #[test]
    fn test_open_while_connected_is_rejected() {
        let (mut worker, _rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();

        let err = worker.open(PORT, 9600).unwrap_err();
        assert_eq!(err, SerialError::AlreadyConnected { port: PORT.to_string() });
        assert_eq!(
            worker.connection_info(),
            Some(ConnectionInfo { port: PORT.to_string(), baud_rate: 115200 })
        );
        assert_eq!(device.open_count(), 1);
        worker.close();
    }

    #[test]
    fn test_close_is_idempotent_and_releases_device() {
        let (mut worker, rx, device) = worker_with_device();
        worker.close();
        assert!(drain(&rx, Duration::from_millis(20)).is_empty());

        worker.open(PORT, 115200).unwrap();
        assert!(device.is_open());
        worker.close();
        assert!(!device.is_open());
        worker.close();

        let events = drain(&rx, Duration::from_millis(50));
        assert_eq!(
            events,
            vec![WorkerEvent::Disconnected {
                port: PORT.to_string(),
                reason: DisconnectReason::Closed,
            }]
        );
        assert_eq!(worker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_close_then_open_never_runs_two_readers() {
        let (mut worker, _rx, device) = worker_with_device();
        let activity = worker.activity();

        for _ in 0..50 {
            worker.open(PORT, 115200).unwrap();
            device.push_inbound(b"x");
            worker.close();
            assert_eq!(activity.current(), 0);
        }

        assert_eq!(activity.peak(), 1);
        assert_eq!(device.open_count(), 50);
    }

    #[test]
    fn test_unplug_emits_single_unexpected_disconnect() {
        let (mut worker, rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();

        device.push_inbound(b"hello");
        assert!(matches!(next_event(&rx), WorkerEvent::Data { .. }));

        for _ in 0..10 {
            device.push_inbound(b"in flight");
        }
        device.unplug();

        let reason = wait_for_disconnect(&rx);
        assert!(matches!(reason, DisconnectReason::Unexpected(_)));
        assert_eq!(worker.state(), ConnectionState::Disconnected);

        let later = drain(&rx, Duration::from_millis(50));
        assert!(later
            .iter()
            .all(|e| !matches!(e, WorkerEvent::Disconnected { .. })));

        // Already disconnected: close is a no-op and emits nothing
        worker.close();
        assert!(drain(&rx, Duration::from_millis(20)).is_empty());
        assert_eq!(send(&mut worker, b"AT"), Err(SerialError::NotConnected));
    }

    #[test]
    fn test_write_failure_does_not_stop_reading() {
        let (mut worker, rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();

        device.fail_writes(true);
        assert!(matches!(send(&mut worker, b"AT\r"), Err(SerialError::Write(_))));
        assert!(worker.is_connected());

        device.push_inbound(b"OK");
        match next_event(&rx) {
            WorkerEvent::Data { bytes, .. } => assert_eq!(bytes, b"OK".to_vec()),
            other => panic!("unexpected event {:?}", other),
        }

        device.fail_writes(false);
        assert_eq!(send(&mut worker, b"AT\r"), Ok(3));
        worker.close();
    }

    #[test]
    fn test_write_timeout_scales_with_payload_and_baud() {
        assert_eq!(write_timeout(0, 115200), WRITE_TIMEOUT);
        // 30 bytes at 300 baud is one second on the wire
        assert_eq!(write_timeout(30, 300), WRITE_TIMEOUT + Duration::from_millis(1000));
        assert!(write_timeout(30, 115200) < WRITE_TIMEOUT + Duration::from_millis(5));
    }

    #[test]
    fn test_slow_line_send_waits_for_drain() {
        let (mut worker, _rx, device) = worker_with_device();
        // tcdrain cost of one byte at 300 baud
        device.drain_per_byte(Duration::from_millis(33));
        worker.open(PORT, 300).unwrap();

        let command = b"AT+CWJAP=\"myssid\",\"secret\"\r\n";
        assert_eq!(send(&mut worker, command), Ok(command.len()));
        assert_eq!(device.written(), command.to_vec());
        worker.close();
    }

    #[test]
    fn test_transmitter_outlives_worker_borrow() {
        let (mut worker, _rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();

        let transmitter = worker.transmitter().unwrap();
        let sender = thread::spawn(move || transmitter.send(b"ATI\r"));
        assert_eq!(sender.join().unwrap(), Ok(4));
        assert_eq!(device.written(), b"ATI\r".to_vec());

        worker.close();
        assert!(matches!(worker.transmitter(), Err(SerialError::NotConnected)));
    }

    #[test]
    fn test_drop_closes_connection() {
        let (mut worker, _rx, device) = worker_with_device();
        worker.open(PORT, 115200).unwrap();
        drop(worker);
        assert!(!device.is_open());
    }
}
