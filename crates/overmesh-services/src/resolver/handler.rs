//! Handler traits for resolver traffic.
//!
//! Handlers are registered by name on a [`ResolverRouter`]. Errors and panics
//! are caught at the router boundary and logged, so a failing handler never
//! takes the router down.

use overmesh_core::{PeerId, ResolverQuery, ResolverResponse, SrdiMessage};

use super::ResolverRouter;

/// Error type returned by handlers.
pub type HandlerError = anyhow::Error;

/// What the router should do once a handler has seen a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Handled,
    /// Walk the query further through the rendezvous mesh.
    Repropagate,
}

pub trait QueryHandler: Send + Sync {
    /// `router` is the router that dispatched the query, for sending replies.
    fn process_query(
        &self,
        router: &ResolverRouter,
        src: PeerId,
        query: &ResolverQuery,
    ) -> Result<QueryOutcome, HandlerError>;

    fn process_response(&self, src: PeerId, response: &ResolverResponse) -> Result<(), HandlerError>;
}

pub trait SrdiHandler: Send + Sync {
    fn process_srdi(&self, src: PeerId, message: &SrdiMessage) -> Result<(), HandlerError>;
}
