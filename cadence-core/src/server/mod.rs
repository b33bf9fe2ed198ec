//! Measurement receiver
//!
//! The listener accepts flows and runs each one on its own OS thread until
//! the flow terminates. Accepted peers are tracked in a [`FlowRegistry`]; a
//! second flow from a peer that is still active is dropped.

pub mod ack;
pub mod registry;
pub mod tcp;
pub mod udp;

pub use ack::{build_ack, send_ack, AckOutcome};
pub use registry::{FlowEntry, FlowRegistry, Registration};
pub use tcp::{run_tcp_flow, TcpFlowOptions, TcpFlowResult};
pub use udp::{
    classify, decode_datagram, run_udp_flow, Classified, UdpFlowOptions, UdpFlowResult,
};

use crate::config::{Protocol, ServerSettings};
use crate::stats::{FlowReporter, FlowSummary};
use crate::threading::pin_thread;
use crate::{Error, Result};
use cadence_transport::{
    FlowSocket, TcpFlowListener, TcpFlowStream, Timestamp, UdpFlowSocket, UdpListener,
};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the listener checks the stop flag
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Why a flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Datagram with the termination flag
    Fin,
    /// Zero-byte read
    Closed,
    /// Receive failed with something other than a timeout
    ReadError,
    /// Session deadline passed
    Deadline,
}

/// Outcome of one served flow
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub peer: SocketAddr,
    pub summary: FlowSummary,
    pub termination: Termination,
    /// Ack exchange, for UDP flows that ended with a FIN
    pub ack: Option<AckOutcome>,
}

enum Listener {
    Udp(UdpListener),
    Tcp(TcpFlowListener),
}

enum Accepted {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

pub struct Server {
    settings: Arc<ServerSettings>,
    listener: Listener,
    local_addr: SocketAddr,
    registry: FlowRegistry,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Validate `settings` and bind the listening socket
    pub fn bind(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        let (listener, local_addr) = match settings.protocol {
            Protocol::Udp => {
                let listener = UdpListener::bind(settings.bind)?;
                let addr = listener.local_addr();
                (Listener::Udp(listener), addr)
            }
            Protocol::Tcp => {
                let listener = TcpFlowListener::bind(settings.bind)?;
                let addr = listener.local_addr()?;
                (Listener::Tcp(listener), addr)
            }
        };
        Ok(Self {
            settings: Arc::new(settings),
            listener,
            local_addr,
            registry: FlowRegistry::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Flag that stops the accept loop once set
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn accept(&mut self) -> Result<Option<(Accepted, SocketAddr)>> {
        Ok(match &mut self.listener {
            Listener::Udp(l) => l.accept(ACCEPT_POLL)?.map(|(s, peer)| (Accepted::Udp(s), peer)),
            Listener::Tcp(l) => l.accept(ACCEPT_POLL)?.map(|(s, peer)| (Accepted::Tcp(s), peer)),
        })
    }

    /// Accept flows until stopped or `max_flows` is reached, then wait for
    /// the running flows and return their reports
    pub fn run(&mut self) -> Result<Vec<FlowReport>> {
        let protocol = self.settings.protocol;
        tracing::info!("Server listening on {} ({})", self.local_addr, protocol);

        let mut flows = FlowThreads::default();
        let mut accepted = 0usize;
        while !self.stop.load(Ordering::Relaxed) {
            flows.reap();
            if self.settings.max_flows.is_some_and(|max| accepted >= max) {
                tracing::info!("Accepted {} flows, no longer listening", accepted);
                break;
            }
            let Some((flow, peer)) = self.accept()? else {
                continue;
            };
            let Some(registration) = self.registry.register(peer, protocol) else {
                tracing::warn!("Flow from {} is already active, dropping duplicate", peer);
                continue;
            };

            let index = accepted;
            accepted += 1;
            tracing::info!("Accepted {} flow {} from {}", protocol, index, peer);

            let settings = Arc::clone(&self.settings);
            flows.spawn(format!("flow-{index}"), move || {
                let _registration = registration;
                serve_flow(index, flow, peer, &settings)
            })?;
            tracing::debug!("{} flow(s) running", flows.running());
        }

        Ok(flows.finish())
    }
}

/// Threads of the flows being served, plus the reports of those that ended
#[derive(Default)]
struct FlowThreads {
    running: Vec<JoinHandle<Result<FlowReport>>>,
    reports: Vec<FlowReport>,
}

impl FlowThreads {
    fn spawn<F>(&mut self, name: String, serve: F) -> Result<()>
    where
        F: FnOnce() -> Result<FlowReport> + Send + 'static,
    {
        self.running.push(thread::Builder::new().name(name).spawn(serve)?);
        Ok(())
    }

    fn running(&self) -> usize {
        self.running.len()
    }

    /// Join the threads whose flow has ended
    fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.running.drain(..).partition(|handle| handle.is_finished());
        self.running = running;
        for handle in done {
            self.collect(handle);
        }
    }

    fn collect(&mut self, handle: JoinHandle<Result<FlowReport>>) {
        match handle.join() {
            Ok(Ok(report)) => self.reports.push(report),
            Ok(Err(e)) => tracing::error!("Flow failed: {}", e),
            Err(_) => tracing::error!("Flow thread panicked"),
        }
    }

    /// Wait for every flow still running
    fn finish(mut self) -> Vec<FlowReport> {
        for handle in std::mem::take(&mut self.running) {
            self.collect(handle);
        }
        self.reports
    }
}

fn serve_flow(
    index: usize,
    flow: Accepted,
    peer: SocketAddr,
    settings: &ServerSettings,
) -> Result<FlowReport> {
    if let Err(e) = pin_thread(index, &settings.cpu_pinning) {
        tracing::warn!("Flow {} not pinned: {}", index, e);
    }
    let deadline = settings.session_time.map(|t| Timestamp::now().add(t));
    let report = match flow {
        Accepted::Udp(socket) => serve_udp(socket, peer, deadline, settings)?,
        Accepted::Tcp(stream) => serve_tcp(stream, peer, deadline, settings)?,
    };
    tracing::info!("Flow from {} ended ({:?})", peer, report.termination);
    Ok(report)
}

fn serve_udp(
    socket: UdpSocket,
    peer: SocketAddr,
    deadline: Option<Timestamp>,
    settings: &ServerSettings,
) -> Result<FlowReport> {
    let rx = settings.rx_timestamp_config();
    let udp = UdpFlowSocket::new(socket, &rx)?;
    udp.set_recv_timeout(settings.recv_timeout())?;
    let mut socket: Box<dyn FlowSocket> =
        if settings.l2_checks { open_capture(udp, settings)? } else { Box::new(udp) };

    let mut reporter =
        FlowReporter::new(peer.to_string(), Protocol::Udp, &settings.report_settings())?;
    let options = UdpFlowOptions {
        sequence: settings.sequence,
        isochronous: settings.isochronous,
        frame_hashes: settings.frame_hashes,
        buffer_len: settings.buffer_len,
        deadline,
        enhanced: settings.enhanced,
        ack: settings.ack.clone(),
    };
    let result = run_udp_flow(socket.as_mut(), &mut reporter, &options)?;
    Ok(FlowReport {
        peer,
        summary: result.summary,
        termination: result.termination,
        ack: result.ack,
    })
}

#[cfg(target_os = "linux")]
fn open_capture(udp: UdpFlowSocket, settings: &ServerSettings) -> Result<Box<dyn FlowSocket>> {
    use cadence_transport::PacketFlowSocket;

    let interface = settings
        .interface
        .as_deref()
        .ok_or_else(|| Error::Config("L2 checks require an interface".into()))?;
    let mut capture = PacketFlowSocket::open(interface, udp, &settings.rx_timestamp_config())?;
    capture.set_recv_timeout(settings.recv_timeout())?;
    Ok(Box::new(capture))
}

#[cfg(not(target_os = "linux"))]
fn open_capture(_udp: UdpFlowSocket, _settings: &ServerSettings) -> Result<Box<dyn FlowSocket>> {
    Err(Error::Config("L2 checks are only supported on Linux".into()))
}

fn serve_tcp(
    stream: TcpStream,
    peer: SocketAddr,
    deadline: Option<Timestamp>,
    settings: &ServerSettings,
) -> Result<FlowReport> {
    let mut stream = TcpFlowStream::new(stream)?;
    stream.set_recv_timeout(settings.recv_timeout())?;
    let mut reporter =
        FlowReporter::new(peer.to_string(), Protocol::Tcp, &settings.report_settings())?;
    let options = TcpFlowOptions {
        buffer_len: settings.buffer_len,
        deadline,
        read_rate: settings.read_rate,
        delay_strategy: settings.delay_strategy,
    };
    let result = run_tcp_flow(&mut stream, &mut reporter, &options)?;
    Ok(FlowReport { peer, summary: result.summary, termination: result.termination, ack: None })
}
