use crate::server::Server;
use crate::vector::{Direction, ExecutionMode, TestVector};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Largest single message the socket transports read in one go.
const MAX_MESSAGE_LEN: usize = 16 * 1024;
/// Upper bound on how long a datagram readiness check waits for a refusal.
const DATAGRAM_READY_WAIT: Duration = Duration::from_millis(50);

/// A connection to a target could not be set up yet.
///
/// Usually the target is still starting; the executor retries these.
#[derive(Error, Debug)]
#[error("Transport to {endpoint} not ready: {reason}")]
pub struct HarnessFailure {
    pub endpoint: String,
    pub reason: String,
}

/// The protocol conversation broke down part-way through a trace.
#[derive(Error, Debug)]
#[error("Execution failed at action {action}: {reason}")]
pub struct ExecutionFailure {
    pub action: usize,
    pub reason: String,
}

/// A byte-oriented connection to one target server.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads one message; an empty read means the peer closed the connection.
    fn receive(&mut self) -> io::Result<Vec<u8>>;

    fn close(&mut self) -> io::Result<()>;
}

/// Executes test vectors against live targets.
///
/// The engine owns the wire format; the fuzzer only asks it to open a
/// transport and to run a trace over it.
pub trait ProtocolEngine: Send + Sync {
    fn connect(
        &self,
        server: &dyn Server,
        mode: ExecutionMode,
    ) -> Result<Box<dyn Transport>, HarnessFailure>;

    /// Runs `vector.trace` over `transport`, recording what happened into the trace.
    fn execute(
        &self,
        vector: &mut TestVector,
        transport: &mut dyn Transport,
    ) -> Result<(), ExecutionFailure>;
}

struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let read = self.stream.read(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

struct UdpTransport {
    socket: UdpSocket,
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.socket.send(bytes).map(|_| ())
    }

    fn receive(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let read = self.socket.recv(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A [`ProtocolEngine`] that replays raw action payloads over sockets.
///
/// `Stream` vectors run over TCP and `Datagram` vectors over UDP. `Send`
/// actions write their payload verbatim; `Receive` actions record whatever
/// the target answers.
///
/// A datagram connect sends one empty datagram and treats a refusal as the
/// target not being ready yet. Targets must ignore empty datagrams.
#[derive(Debug, Clone)]
pub struct SocketEngine {
    io_timeout: Duration,
}

impl SocketEngine {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    /// UDP connect never fails on its own; an ICMP port unreachable only
    /// surfaces as `ConnectionRefused` on a later receive.
    fn check_datagram_peer(&self, socket: &UdpSocket) -> io::Result<()> {
        socket.set_read_timeout(Some(self.io_timeout.min(DATAGRAM_READY_WAIT)))?;
        socket.send(&[])?;
        let mut scratch = [0u8; 1];
        match socket.recv(&mut scratch) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn not_ready(server: &dyn Server, reason: impl ToString) -> HarnessFailure {
        HarnessFailure {
            endpoint: server.endpoint().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ProtocolEngine for SocketEngine {
    fn connect(
        &self,
        server: &dyn Server,
        mode: ExecutionMode,
    ) -> Result<Box<dyn Transport>, HarnessFailure> {
        let address = server
            .endpoint()
            .to_socket_addrs()
            .map_err(|e| Self::not_ready(server, e))?
            .next()
            .ok_or_else(|| Self::not_ready(server, "endpoint resolved to no address"))?;

        match mode {
            ExecutionMode::Stream => {
                let stream = TcpStream::connect_timeout(&address, self.io_timeout)
                    .map_err(|e| Self::not_ready(server, e))?;
                stream
                    .set_read_timeout(Some(self.io_timeout))
                    .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
                    .and_then(|_| stream.set_nodelay(true))
                    .map_err(|e| Self::not_ready(server, e))?;
                Ok(Box::new(TcpTransport { stream }))
            }
            ExecutionMode::Datagram => {
                let local = if address.is_ipv4() {
                    "0.0.0.0:0"
                } else {
                    "[::]:0"
                };
                let socket = UdpSocket::bind(local).map_err(|e| Self::not_ready(server, e))?;
                socket
                    .connect(address)
                    .and_then(|_| self.check_datagram_peer(&socket))
                    .and_then(|_| socket.set_read_timeout(Some(self.io_timeout)))
                    .map_err(|e| Self::not_ready(server, e))?;
                Ok(Box::new(UdpTransport { socket }))
            }
        }
    }

    fn execute(
        &self,
        vector: &mut TestVector,
        transport: &mut dyn Transport,
    ) -> Result<(), ExecutionFailure> {
        for (index, action) in vector.trace.actions.iter_mut().enumerate() {
            match action.direction {
                Direction::Send => {
                    transport
                        .send(&action.payload)
                        .map_err(|e| ExecutionFailure {
                            action: index,
                            reason: format!("sending {}: {}", action.message, e),
                        })?;
                }
                Direction::Receive => {
                    let received = transport.receive().map_err(|e| ExecutionFailure {
                        action: index,
                        reason: format!("receiving {}: {}", action.message, e),
                    })?;
                    if received.is_empty() {
                        return Err(ExecutionFailure {
                            action: index,
                            reason: format!("connection closed before {}", action.message),
                        });
                    }
                    action.recorded = Some(received);
                }
            }
            action.executed = true;
            trace!(action = index, message = action.message.as_str(), "executed action");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A transport that accepts everything and echoes nothing.
    pub struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn receive(&mut self) -> io::Result<Vec<u8>> {
            Ok(vec![0])
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// What a [`ScriptedEngine`] does when asked to execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    /// A [`ProtocolEngine`] double with scripted connection and execution outcomes.
    pub struct ScriptedEngine {
        /// How many `connect` calls fail before one succeeds.
        pub connect_failures: AtomicUsize,
        pub behaviour: Behaviour,
        pub connects: AtomicUsize,
        pub executions: AtomicUsize,
        /// Trace lengths seen by `execute`, in call order.
        pub seen: Mutex<VecDeque<usize>>,
    }

    impl ScriptedEngine {
        pub fn new(behaviour: Behaviour) -> Self {
            Self {
                connect_failures: AtomicUsize::new(0),
                behaviour,
                connects: AtomicUsize::new(0),
                executions: AtomicUsize::new(0),
                seen: Mutex::new(VecDeque::new()),
            }
        }

        pub fn failing_connects(self, failures: usize) -> Self {
            self.connect_failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    impl ProtocolEngine for ScriptedEngine {
        fn connect(
            &self,
            server: &dyn Server,
            _mode: ExecutionMode,
        ) -> Result<Box<dyn Transport>, HarnessFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HarnessFailure {
                    endpoint: server.endpoint().to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(NullTransport))
        }

        fn execute(
            &self,
            vector: &mut TestVector,
            _transport: &mut dyn Transport,
        ) -> Result<(), ExecutionFailure> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push_back(vector.trace.len());
            for action in &mut vector.trace.actions {
                action.executed = true;
            }
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(ExecutionFailure {
                    action: 0,
                    reason: "alert received".to_string(),
                }),
                Behaviour::Panic => panic!("engine blew up"),
            }
        }
    }
}
