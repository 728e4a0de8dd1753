//! UDP datagram transport.
//!
//! One socket carries everything. Sends are queued to a [`SendWorker`]; the
//! [`ReceiveLoop`] decodes frames, learns the sender's address as its route
//! and hands each message to its listener on a fresh task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use overmesh_core::wire::{decode_frame, encode_frame, MAX_FRAME};
use overmesh_core::{PeerId, RouteDescriptor, WireMessage};
use overmesh_services::{MessageListener, Transport, TransportError, TransportEvent};

use crate::net::{format_endpoint, multicast_dest, parse_endpoint};

/// Hop budget stamped on unicast frames.
const UNICAST_TTL: u8 = 1;

/// How long the send worker keeps accepting farewell traffic after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

pub struct Outgoing {
    to: SocketAddr,
    peer: Option<PeerId>,
    frame: Vec<u8>,
    /// Multicast hop limit for this datagram.
    hops: Option<u8>,
}

struct Inner {
    local: PeerId,
    endpoints: Vec<String>,
    port: u16,
    interface_index: Option<u32>,
    socket: Arc<UdpSocket>,
    routes: DashMap<PeerId, SocketAddr>,
    listeners: DashMap<(String, String), Arc<dyn MessageListener>>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    /// Wrap a bound socket. `endpoints` are advertised as our route; when
    /// empty the socket's own address is used. The returned receiver feeds a
    /// [`SendWorker`].
    pub fn new(
        local: PeerId,
        socket: UdpSocket,
        mut endpoints: Vec<String>,
        interface_index: Option<u32>,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Outgoing>)> {
        let addr = socket.local_addr()?;
        if endpoints.is_empty() && !addr.ip().is_unspecified() {
            endpoints.push(format_endpoint(addr));
        }
        let (outbound, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            local,
            endpoints,
            port: addr.port(),
            interface_index,
            socket: Arc::new(socket),
            routes: DashMap::new(),
            listeners: DashMap::new(),
            outbound,
            events,
        });
        Ok((Self { inner }, rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn route_count(&self) -> usize {
        self.inner.routes.len()
    }

    fn queue(&self, out: Outgoing) -> Result<(), TransportError> {
        self.inner
            .outbound
            .send(out)
            .map_err(|_| TransportError::Closed)
    }

    fn resolve(&self, dest: &PeerId, hint: Option<&RouteDescriptor>) -> Option<SocketAddr> {
        if let Some(addr) = self.inner.routes.get(dest) {
            return Some(*addr);
        }
        let hint = hint.filter(|h| h.peer == *dest)?;
        let addr = hint.endpoints.iter().find_map(|ep| parse_endpoint(ep))?;
        self.inner.routes.insert(*dest, addr);
        Some(addr)
    }
}

impl Transport for UdpTransport {
    fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    fn local_route(&self) -> Option<RouteDescriptor> {
        if self.inner.endpoints.is_empty() {
            return None;
        }
        Some(RouteDescriptor {
            peer: self.inner.local,
            endpoints: self.inner.endpoints.clone(),
        })
    }

    fn unicast(
        &self,
        dest: &PeerId,
        hint: Option<&RouteDescriptor>,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let to = self
            .resolve(dest, hint)
            .ok_or(TransportError::NoRoute(*dest))?;
        let frame = encode_frame(&self.inner.local, &message, UNICAST_TTL, false)?;
        self.queue(Outgoing {
            to,
            peer: Some(*dest),
            frame,
            hops: None,
        })
    }

    fn send_to_address(&self, address: &str, message: WireMessage) -> Result<(), TransportError> {
        let to = parse_endpoint(address)
            .ok_or_else(|| TransportError::BadAddress(address.to_string()))?;
        let frame = encode_frame(&self.inner.local, &message, UNICAST_TTL, false)?;
        self.queue(Outgoing {
            to,
            peer: None,
            frame,
            hops: None,
        })
    }

    fn propagate_local(&self, message: WireMessage, ttl: u8) -> Result<(), TransportError> {
        let index = self
            .inner
            .interface_index
            .ok_or(TransportError::NoLocalNetwork("no interface configured"))?;
        if ttl == 0 {
            return Ok(());
        }
        let to = multicast_dest(index, self.inner.port)
            .map_err(|e| TransportError::BadAddress(e.to_string()))?;
        let frame = encode_frame(&self.inner.local, &message, ttl, true)?;
        self.queue(Outgoing {
            to,
            peer: None,
            frame,
            hops: Some(ttl),
        })
    }

    fn add_route(&self, route: &RouteDescriptor) {
        if route.peer == self.inner.local {
            return;
        }
        if let Some(addr) = route.endpoints.iter().find_map(|ep| parse_endpoint(ep)) {
            self.inner.routes.insert(route.peer, addr);
        }
    }

    fn register_listener(
        &self,
        service: &str,
        param: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        self.inner
            .listeners
            .insert((service.to_string(), param.to_string()), listener)
    }

    fn unregister_listener(&self, service: &str, param: &str) -> Option<Arc<dyn MessageListener>> {
        self.inner
            .listeners
            .remove(&(service.to_string(), param.to_string()))
            .map(|(_, l)| l)
    }
}

// ── Send worker ───────────────────────────────────────────────────────────────

pub struct SendWorker {
    transport: UdpTransport,
    rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        transport: UdpTransport,
        rx: mpsc::UnboundedReceiver<Outgoing>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                    while let Ok(out) = self.rx.try_recv() {
                        self.send(out).await;
                    }
                    return Ok(());
                }

                next = self.rx.recv() => {
                    let Some(out) = next else {
                        return Ok(());
                    };
                    self.send(out).await;
                }
            }
        }
    }

    async fn send(&self, out: Outgoing) {
        let socket = &self.transport.inner.socket;
        if let Some(hops) = out.hops {
            if let Err(e) = SockRef::from(socket.as_ref()).set_multicast_hops_v6(u32::from(hops)) {
                tracing::warn!(error = %e, "failed to set multicast hop limit");
            }
        }
        match socket.send_to(&out.frame, out.to).await {
            Ok(n) => tracing::trace!(bytes = n, to = %out.to, "datagram sent"),
            Err(e) => {
                tracing::warn!(to = %out.to, error = %e, "datagram send failed");
                if let Some(peer) = out.peer {
                    let _ = self
                        .transport
                        .inner
                        .events
                        .send(TransportEvent::SendFailed { peer });
                }
            }
        }
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

pub struct ReceiveLoop {
    transport: UdpTransport,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiveLoop {
    pub fn new(transport: UdpTransport, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            transport,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let socket = self.transport.inner.socket.clone();
        let mut buf = vec![0u8; MAX_FRAME];

        tracing::info!(port = self.transport.inner.port, "overlay receiver starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("overlay receiver shutting down");
                    return Ok(());
                }

                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle(&buf[..len], from),
                        Err(e) => tracing::warn!(error = %e, "recv_from failed"),
                    }
                }
            }
        }
    }

    fn handle(&self, datagram: &[u8], from: SocketAddr) {
        let frame = match decode_frame(datagram) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(from = %from, error = %e, "undecodable datagram dropped");
                return;
            }
        };
        let inner = &self.transport.inner;
        if frame.source == inner.local {
            return;
        }
        inner.routes.insert(frame.source, from);

        let key = (frame.message.service.clone(), frame.message.param.clone());
        let listener = inner.listeners.get(&key).map(|l| l.value().clone());
        let Some(listener) = listener else {
            tracing::debug!(
                service = %key.0,
                param = %key.1,
                from = %from,
                "no listener for datagram"
            );
            return;
        };
        let src = frame.source;
        let message = frame.message;
        tokio::spawn(async move {
            listener.on_message(src, message);
        });
    }
}
