//! `overmesh.echo`: answers every query with its own payload.

use overmesh_core::{PeerId, ResolverQuery, ResolverResponse};
use overmesh_services::{HandlerError, QueryHandler, QueryOutcome, ResolverRouter};

pub const ECHO_HANDLER: &str = "overmesh.echo";

pub struct EchoHandler;

impl QueryHandler for EchoHandler {
    fn process_query(
        &self,
        router: &ResolverRouter,
        src: PeerId,
        query: &ResolverQuery,
    ) -> Result<QueryOutcome, HandlerError> {
        let reply_to = query.reply_to().unwrap_or(src);
        let response = ResolverResponse::to_query(query, query.payload.clone());
        router.send_response(Some(&reply_to), response)?;
        tracing::debug!(peer = %reply_to, query_id = query.query_id, "echo answered");
        Ok(QueryOutcome::Handled)
    }

    fn process_response(&self, src: PeerId, response: &ResolverResponse) -> Result<(), HandlerError> {
        tracing::info!(
            peer = %src,
            query_id = response.query_id,
            payload = %response.payload,
            "echo response"
        );
        Ok(())
    }
}
