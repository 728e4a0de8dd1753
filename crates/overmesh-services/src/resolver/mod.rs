//! Resolver router.
//!
//! Demultiplexes inbound queries, responses and SRDI updates to named
//! handlers, and sends outbound ones either by unicast or through the
//! rendezvous mesh. Hop counts bound how far a query may be re-propagated:
//! queries arriving with more than `max_initial_hops` are dropped, and a
//! re-propagation that would exceed `max_repropagate_hops` is not sent.

mod handler;
mod registry;

pub use handler::{HandlerError, QueryHandler, QueryOutcome, SrdiHandler};
pub use registry::HandlerRegistry;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;

use overmesh_core::codec::CodecError;
use overmesh_core::config::ResolverConfig;
use overmesh_core::message::RESOLVER_SERVICE;
use overmesh_core::{
    Credential, Encoding, GroupId, MessageKind, PeerId, ResolverQuery, ResolverResponse,
    SrdiMessage, WireMessage,
};

use crate::rendezvous::RendezvousManager;
use crate::transport::{MessageListener, Transport, TransportError};

/// What the router did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Sent on through the rendezvous mesh with this hop count.
    Repropagated { hop_count: u32 },
    /// The handler returned an error or panicked.
    HandlerFailed,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    /// Our own query, echoed back by the mesh.
    Loopback,
    HopLimit,
    NoHandler,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("unicast to {peer} failed: {source}")]
    Unicast {
        peer: PeerId,
        #[source]
        source: TransportError,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] CodecError),
}

struct Inner {
    group: GroupId,
    local: PeerId,
    config: ResolverConfig,
    transport: Arc<dyn Transport>,
    rendezvous: RendezvousManager,
    handlers: HandlerRegistry<dyn QueryHandler>,
    srdi_handlers: HandlerRegistry<dyn SrdiHandler>,
    credential: RwLock<Option<Credential>>,
    next_query_id: AtomicI64,
}

impl Inner {
    fn param(&self, kind: MessageKind) -> String {
        kind.param(&self.group)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for kind in MessageKind::ALL {
            let param = self.param(kind);
            self.transport.unregister_listener(RESOLVER_SERVICE, &param);
            self.rendezvous
                .unregister_propagate_listener(RESOLVER_SERVICE, &param);
        }
    }
}

/// Feeds one resolver endpoint into the router.
struct Endpoint {
    router: Weak<Inner>,
    kind: MessageKind,
}

impl MessageListener for Endpoint {
    fn on_message(&self, src: PeerId, message: WireMessage) {
        if let Some(inner) = self.router.upgrade() {
            ResolverRouter { inner }.process_inbound(self.kind, src, &message);
        }
    }

    /// Queries are re-propagated by the router, one hop further, or not at all.
    fn relay_propagated(&self) -> bool {
        false
    }
}

/// Per-group resolver router. Cheap to clone.
#[derive(Clone)]
pub struct ResolverRouter {
    inner: Arc<Inner>,
}

impl ResolverRouter {
    pub fn new(
        config: ResolverConfig,
        transport: Arc<dyn Transport>,
        rendezvous: RendezvousManager,
    ) -> Self {
        let inner = Arc::new(Inner {
            group: *rendezvous.group(),
            local: transport.local_peer(),
            config,
            transport,
            rendezvous,
            handlers: HandlerRegistry::new(),
            srdi_handlers: HandlerRegistry::new(),
            credential: RwLock::new(None),
            next_query_id: AtomicI64::new(1),
        });

        for kind in MessageKind::ALL {
            let param = inner.param(kind);
            let endpoint = Arc::new(Endpoint {
                router: Arc::downgrade(&inner),
                kind,
            });
            inner
                .transport
                .register_listener(RESOLVER_SERVICE, &param, endpoint.clone());
            inner
                .rendezvous
                .register_propagate_listener(RESOLVER_SERVICE, &param, endpoint);
        }
        Self { inner }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn group(&self) -> &GroupId {
        &self.inner.group
    }

    pub fn rendezvous(&self) -> &RendezvousManager {
        &self.inner.rendezvous
    }

    // ── Registries ────────────────────────────────────────────────────────────

    pub fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler>,
    ) -> Option<Arc<dyn QueryHandler>> {
        tracing::debug!(name, "query handler registered");
        self.inner.handlers.register(name, handler)
    }

    pub fn unregister_handler(&self, name: &str) -> Option<Arc<dyn QueryHandler>> {
        self.inner.handlers.unregister(name)
    }

    pub fn register_srdi_handler(
        &self,
        name: &str,
        handler: Arc<dyn SrdiHandler>,
    ) -> Option<Arc<dyn SrdiHandler>> {
        tracing::debug!(name, "srdi handler registered");
        self.inner.srdi_handlers.register(name, handler)
    }

    pub fn unregister_srdi_handler(&self, name: &str) -> Option<Arc<dyn SrdiHandler>> {
        self.inner.srdi_handlers.unregister(name)
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.inner.handlers.names()
    }

    pub fn srdi_handler_names(&self) -> Vec<String> {
        self.inner.srdi_handlers.names()
    }

    /// A fresh query id, unique for the life of this router.
    pub fn next_query_id(&self) -> i64 {
        self.inner.next_query_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Credentials ───────────────────────────────────────────────────────────

    /// Credential attached to outgoing messages that do not carry one.
    pub fn set_default_credential(&self, credential: Option<Credential>) {
        *self
            .inner
            .credential
            .write()
            .unwrap_or_else(|p| p.into_inner()) = credential;
    }

    pub fn default_credential(&self) -> Option<Credential> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Keep the default credential in step with a membership feed. The task
    /// ends when the sender is dropped or the router goes away.
    pub fn follow_credentials(
        &self,
        mut feed: watch::Receiver<Option<Credential>>,
    ) -> tokio::task::JoinHandle<()> {
        self.set_default_credential(feed.borrow_and_update().clone());
        let router = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while feed.changed().await.is_ok() {
                let Some(inner) = router.upgrade() else {
                    break;
                };
                let credential = feed.borrow_and_update().clone();
                tracing::debug!(present = credential.is_some(), "default credential refreshed");
                ResolverRouter { inner }.set_default_credential(credential);
            }
        })
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// `None` walks the query through the rendezvous mesh and floods it to
    /// local neighbors; that path never fails. `Some(peer)` unicasts.
    pub fn send_query(&self, dest: Option<&PeerId>, mut query: ResolverQuery) -> Result<(), ResolverError> {
        self.stamp(&mut query.origin, &mut query.credential);
        match dest {
            None => {
                if query.source_route.is_none() {
                    query.source_route = self.inner.transport.local_route();
                }
                let Some(message) = self.encode_or_log(MessageKind::Query, &query, Encoding::Json) else {
                    return Ok(());
                };
                self.propagate(MessageKind::Query, message.clone());
                if let Err(e) = self
                    .inner
                    .transport
                    .propagate_local(message, self.inner.config.neighbor_ttl)
                {
                    tracing::debug!(error = %e, "local query flood failed");
                }
                Ok(())
            }
            Some(peer) => {
                let message = self.encode(MessageKind::Query, &query, Encoding::Json)?;
                self.unicast(peer, message)
            }
        }
    }

    /// Like [`send_query`](Self::send_query) but without the local flood.
    /// A source route on the response is handed to the transport first.
    pub fn send_response(
        &self,
        dest: Option<&PeerId>,
        mut response: ResolverResponse,
    ) -> Result<(), ResolverError> {
        self.stamp(&mut response.origin, &mut response.credential);
        match dest {
            None => {
                if let Some(message) =
                    self.encode_or_log(MessageKind::Response, &response, Encoding::Json)
                {
                    self.propagate(MessageKind::Response, message);
                }
                Ok(())
            }
            Some(peer) => {
                if let Some(route) = &response.source_route {
                    self.inner.transport.add_route(route);
                }
                let message = self.encode(MessageKind::Response, &response, Encoding::Json)?;
                self.unicast(peer, message)
            }
        }
    }

    /// SRDI travels gzip-compressed, by unicast or through the rendezvous mesh.
    pub fn send_srdi(&self, dest: Option<&PeerId>, mut srdi: SrdiMessage) -> Result<(), ResolverError> {
        self.stamp(&mut srdi.origin, &mut srdi.credential);
        match dest {
            None => {
                if let Some(message) = self.encode_or_log(MessageKind::Srdi, &srdi, Encoding::Gzip) {
                    self.propagate(MessageKind::Srdi, message);
                }
                Ok(())
            }
            Some(peer) => {
                let message = self.encode(MessageKind::Srdi, &srdi, Encoding::Gzip)?;
                self.unicast(peer, message)
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Dispatch one inbound message of `kind` received from `src`.
    pub fn process_inbound(&self, kind: MessageKind, src: PeerId, message: &WireMessage) -> Disposition {
        match kind {
            MessageKind::Query => self.process_query(src, message),
            MessageKind::Response => self.process_response(src, message),
            MessageKind::Srdi => self.process_srdi(src, message),
        }
    }

    fn process_query(&self, src: PeerId, message: &WireMessage) -> Disposition {
        let Some(query) = decode::<ResolverQuery>(MessageKind::Query, src, message) else {
            return Disposition::Dropped(DropReason::Malformed);
        };
        if query.origin == Some(self.inner.local) {
            return Disposition::Dropped(DropReason::Loopback);
        }
        if query.hop_count > self.inner.config.max_initial_hops {
            tracing::debug!(
                peer = %src,
                handler = %query.handler_name,
                hop_count = query.hop_count,
                "query over hop limit dropped"
            );
            return Disposition::Dropped(DropReason::HopLimit);
        }

        let Some(handler) = self.inner.handlers.get(&query.handler_name) else {
            if self.inner.rendezvous.is_rendezvous() {
                return self.repropagate(query);
            }
            tracing::debug!(peer = %src, handler = %query.handler_name, "no handler for query");
            return Disposition::Dropped(DropReason::NoHandler);
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler.process_query(self, src, &query)));
        match result {
            Ok(Ok(QueryOutcome::Handled)) => Disposition::Handled,
            Ok(Ok(QueryOutcome::Repropagate)) => self.repropagate(query),
            Ok(Err(e)) => {
                tracing::warn!(handler = %query.handler_name, error = %e, "query handler failed");
                Disposition::HandlerFailed
            }
            Err(_) => {
                tracing::warn!(handler = %query.handler_name, "query handler panicked");
                Disposition::HandlerFailed
            }
        }
    }

    fn process_response(&self, src: PeerId, message: &WireMessage) -> Disposition {
        let Some(response) = decode::<ResolverResponse>(MessageKind::Response, src, message) else {
            return Disposition::Dropped(DropReason::Malformed);
        };
        let Some(handler) = self.inner.handlers.get(&response.handler_name) else {
            tracing::debug!(peer = %src, handler = %response.handler_name, "no handler for response");
            return Disposition::Dropped(DropReason::NoHandler);
        };
        let result = catch_unwind(AssertUnwindSafe(|| handler.process_response(src, &response)));
        settle("response", &response.handler_name, result)
    }

    fn process_srdi(&self, src: PeerId, message: &WireMessage) -> Disposition {
        let Some(srdi) = decode::<SrdiMessage>(MessageKind::Srdi, src, message) else {
            return Disposition::Dropped(DropReason::Malformed);
        };
        let Some(handler) = self.inner.srdi_handlers.get(&srdi.handler_name) else {
            tracing::debug!(peer = %src, handler = %srdi.handler_name, "no handler for srdi");
            return Disposition::Dropped(DropReason::NoHandler);
        };
        let result = catch_unwind(AssertUnwindSafe(|| handler.process_srdi(src, &srdi)));
        settle("srdi", &srdi.handler_name, result)
    }

    fn repropagate(&self, mut query: ResolverQuery) -> Disposition {
        let hop_count = query.increment_hop_count();
        if hop_count > self.inner.config.max_repropagate_hops {
            tracing::debug!(handler = %query.handler_name, hop_count, "query not re-propagated, hop limit");
            return Disposition::Dropped(DropReason::HopLimit);
        }
        let Some(message) = self.encode_or_log(MessageKind::Query, &query, Encoding::Json) else {
            return Disposition::Dropped(DropReason::Malformed);
        };
        let sent = self.propagate(MessageKind::Query, message);
        tracing::debug!(handler = %query.handler_name, hop_count, sent, "query re-propagated");
        Disposition::Repropagated { hop_count }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn stamp(&self, origin: &mut Option<PeerId>, credential: &mut Option<Credential>) {
        origin.get_or_insert(self.inner.local);
        if credential.is_none() {
            *credential = self.default_credential();
        }
    }

    fn encode<T: Serialize>(
        &self,
        kind: MessageKind,
        value: &T,
        encoding: Encoding,
    ) -> Result<WireMessage, ResolverError> {
        Ok(WireMessage::encode(
            RESOLVER_SERVICE,
            self.inner.param(kind),
            value,
            encoding,
        )?)
    }

    fn encode_or_log<T: Serialize>(
        &self,
        kind: MessageKind,
        value: &T,
        encoding: Encoding,
    ) -> Option<WireMessage> {
        match self.encode(kind, value, encoding) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "resolver message not sent");
                None
            }
        }
    }

    fn propagate(&self, kind: MessageKind, message: WireMessage) -> usize {
        self.inner.rendezvous.propagate(
            message,
            RESOLVER_SERVICE,
            &self.inner.param(kind),
            self.inner.config.default_ttl,
        )
    }

    fn unicast(&self, peer: &PeerId, message: WireMessage) -> Result<(), ResolverError> {
        self.inner
            .transport
            .unicast(peer, None, message)
            .map_err(|source| ResolverError::Unicast { peer: *peer, source })
    }
}

fn decode<T: DeserializeOwned>(kind: MessageKind, src: PeerId, message: &WireMessage) -> Option<T> {
    match message.decode() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(peer = %src, kind = kind.as_str(), error = %e, "malformed resolver message dropped");
            None
        }
    }
}

fn settle(
    what: &str,
    handler: &str,
    result: std::thread::Result<Result<(), HandlerError>>,
) -> Disposition {
    match result {
        Ok(Ok(())) => Disposition::Handled,
        Ok(Err(e)) => {
            tracing::warn!(handler, error = %e, "{what} handler failed");
            Disposition::HandlerFailed
        }
        Err(_) => {
            tracing::warn!(handler, "{what} handler panicked");
            Disposition::HandlerFailed
        }
    }
}
