//! Node context and inbound dispatch.
//!
//! `NodeContext` bundles everything a protocol handler needs: who we are,
//! the collaborators, and the message service for onward hops. `Node` owns
//! the dispatcher and is what the connector delivers decoded requests to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use trellis_core::envelope::{Routing, Status, WireError};
use trellis_core::{Envelope, NodeAddress};

use crate::census::Census;
use crate::connector::LocalDelivery;
use crate::dossier::Dossier;
use crate::publications::PublicationIndex;
use crate::settings::{snapshot, RoutingSettings, SharedRoutingSettings};
use crate::table::NeighbourTable;
use crate::transport::{MessageService, TransportError};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("time to live exhausted")]
    Expired,

    #[error("next hop {hop} unreachable: {source}")]
    Unreachable {
        hop: NodeAddress,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{operation} answered {status:?}")]
    Rejected { operation: String, status: Status },
}

/// Outcome of trying to pass a request one hop closer to its destination.
#[derive(Debug)]
pub enum Relay {
    /// No closer reachable node is known; this node answers.
    Root,
    /// A closer node answered; its reply is ready to hand back.
    Replied(Envelope),
}

pub struct NodeContext {
    pub local: NodeAddress,
    pub network_id: String,
    pub table: Arc<dyn NeighbourTable>,
    pub dossier: Arc<dyn Dossier>,
    pub publications: Arc<dyn PublicationIndex>,
    pub census: Arc<dyn Census>,
    pub messages: MessageService,
    pub routing: SharedRoutingSettings,
}

impl NodeContext {
    pub fn routing_settings(&self) -> RoutingSettings {
        snapshot(&self.routing)
    }

    /// Change routing settings on a running node. Daemons pick the change up
    /// at the top of their next iteration.
    pub fn update_routing_settings(&self, change: impl FnOnce(&mut RoutingSettings)) {
        let mut guard = match self.routing.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        change(&mut guard);
    }

    /// Forward `request` one hop toward its destination with one hop spent.
    ///
    /// Under loose routing an unreachable hop is dropped from the table and
    /// the next candidate is tried; when none remain this node is root.
    /// Under exact routing the first unreachable hop is an error.
    pub async fn route_onward(&self, request: &Envelope) -> Result<Relay, RoutingError> {
        let forwarded = request.forwarded().ok_or(RoutingError::Expired)?;
        let destination = request.header.destination;

        while let Some(hop) = self.table.next_hop(&destination) {
            match self.messages.transmit(&hop, &forwarded).await {
                Ok(reply) => return Ok(Relay::Replied(reply)),
                Err(source) if request.header.routing == Routing::Loose => {
                    tracing::warn!(hop = %hop, error = %source, "next hop unreachable, dropping from table");
                    self.table.remove(&hop);
                }
                Err(source) => return Err(RoutingError::Unreachable { hop, source }),
            }
        }
        Ok(Relay::Root)
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// A service reachable by subject name. Always answers, with a non-ok
/// status for application-level failures.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn service(&self) -> &'static str;

    async fn handle(&self, request: Envelope) -> Envelope;
}

#[derive(Default)]
pub struct ServiceDispatcher {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl ServiceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(handler.service(), handler);
    }

    pub fn handler(&self, service: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(service)
    }
}

pub struct Node {
    context: Arc<NodeContext>,
    dispatcher: ServiceDispatcher,
}

impl Node {
    pub fn new(context: Arc<NodeContext>, dispatcher: ServiceDispatcher) -> Self {
        Self { context, dispatcher }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub async fn receive(&self, request: Envelope) -> Envelope {
        let header = &request.header;
        if header.trace {
            tracing::info!(
                from = %header.source,
                to = %header.destination.short(),
                service = %header.subject.service,
                operation = %header.subject.operation,
                ttl = header.time_to_live,
                "traced request"
            );
        }

        if header.time_to_live == 0 {
            tracing::debug!(from = %header.source, "time to live exhausted");
            return request.compose_reply(&self.context.local, Status::Undeliverable, Bytes::new());
        }

        let Some(handler) = self.dispatcher.handler(&header.subject.service) else {
            tracing::warn!(
                from = %header.source,
                service = %header.subject.service,
                "no handler for service"
            );
            return request.compose_reply(&self.context.local, Status::Failed, Bytes::new());
        };

        let trace = header.trace;
        let reply = handler.handle(request).await;
        if trace {
            tracing::info!(to = %reply.header.destination.short(), status = ?reply.header.status, "traced reply");
        }
        reply
    }
}

#[async_trait]
impl LocalDelivery for Node {
    async fn deliver(&self, request: Envelope) -> Envelope {
        self.receive(request).await
    }
}
