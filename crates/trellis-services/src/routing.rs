//! Routing maintenance protocol: Join and Ping.
//!
//! Both travel under the `routing` service. Join bootstraps a new node
//! through a gateway: the request is routed loosely toward the joiner's own
//! id, and every hop on the way back adds its neighbours to the answer. Ping
//! checks liveness and swaps tables; the receiver always learns the sender.
//!
//! The caller side of both lives here too, along with the two passes the
//! maintenance daemons run: `introduce` (ping neighbours, learn theirs) and
//! `reunite` (ping remembered peers that have dropped out of the table).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use trellis_core::envelope::{decode_payload, encode_payload, unix_millis, Routing, Status, Transmission};
use trellis_core::message::{subjects, JoinRequest, JoinResponse, PingRequest, PingResponse, Publications};
use trellis_core::{Envelope, NodeAddress, Subject};

use crate::dossier::Metric;
use crate::node::{MessageHandler, NodeContext, Relay, RoutingError};
use crate::publications::merge_all;

/// What one introduction pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroductionPass {
    /// One neighbour or none: nothing to gossip with.
    TooFewNeighbours,
    Swept { pinged: usize, lost: usize, added: usize },
}

/// What one reunion pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReunionPass {
    pub attempted: usize,
    pub recovered: usize,
}

pub struct RoutingProtocol {
    ctx: Arc<NodeContext>,
}

impl RoutingProtocol {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    // ── Join ─────────────────────────────────────────────────────────────

    /// Join the overlay through `gateway`. Returns `None` when asked to join
    /// through this node itself.
    pub async fn join(&self, gateway: &NodeAddress) -> Result<Option<JoinResponse>, RoutingError> {
        let local = &self.ctx.local;
        if gateway.id() == local.id() {
            tracing::warn!(gateway = %gateway, "refusing to join through self");
            return Ok(None);
        }

        let request = Envelope::request(
            local.clone(),
            *local.id(),
            Subject::new(subjects::ROUTING, subjects::JOIN),
            encode_payload(&JoinRequest)?,
        )
        .with_transmission(Transmission::Multicast)
        .with_routing(Routing::Loose);

        let reply = self.ctx.messages.send(gateway, &request).await?;
        if !reply.is_ok() {
            return Err(RoutingError::Rejected {
                operation: subjects::JOIN.into(),
                status: reply.header.status,
            });
        }
        let response: JoinResponse = decode_payload(&reply.payload)?;

        if response.network_id != self.ctx.network_id {
            tracing::warn!(
                ours = %self.ctx.network_id,
                theirs = %response.network_id,
                "joined a node on a different network"
            );
        }
        merge_all(self.ctx.publications.as_ref(), response.publications.clone());
        let added = response
            .neighbours
            .iter()
            .filter(|a| a.id() != local.id())
            .filter(|a| self.ctx.table.add((*a).clone()))
            .count();
        self.ctx.census.merge_local(response.census.clone());

        tracing::info!(
            gateway = %gateway,
            offered = response.neighbours.len(),
            added,
            "joined overlay"
        );
        Ok(Some(response))
    }

    async fn handle_join(&self, request: Envelope) -> Envelope {
        let local = &self.ctx.local;
        match self.ctx.route_onward(&request).await {
            Ok(Relay::Root) => {
                let response = JoinResponse {
                    network_id: self.ctx.network_id.clone(),
                    neighbours: self.ctx.table.addresses(),
                    publications: self.rooted_publications(),
                    census: self.ctx.census.snapshot(None, &HashSet::new()),
                };
                tracing::debug!(joiner = %request.header.source, neighbours = response.neighbours.len(), "answering join as root");
                reply_with(&request, local, &response)
            }
            Ok(Relay::Replied(reply)) if reply.is_ok() => {
                let mut response: JoinResponse = match decode_payload(&reply.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable join response from next hop");
                        return request.compose_reply(local, Status::Failed, Bytes::new());
                    }
                };
                response.neighbours.extend(self.ctx.table.addresses());
                match encode_payload(&response) {
                    Ok(payload) => reply.with_payload(payload),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to re-encode join response");
                        request.compose_reply(local, Status::Failed, Bytes::new())
                    }
                }
            }
            Ok(Relay::Replied(reply)) => reply,
            Err(e) => failure_reply(&request, local, e),
        }
    }

    /// Publications for objects this node is root of.
    fn rooted_publications(&self) -> Publications {
        let table = &self.ctx.table;
        self.ctx
            .publications
            .keys()
            .into_iter()
            .filter(|id| table.is_root(id))
            .map(|id| (id, self.ctx.publications.publishers_of(&id)))
            .filter(|(_, records)| !records.is_empty())
            .collect()
    }

    // ── Ping ─────────────────────────────────────────────────────────────

    /// Ping `target` directly. Updates the dossier either way; on success
    /// merges the returned publications and adds `target` to the table.
    pub async fn ping(&self, target: &NodeAddress) -> Option<PingResponse> {
        self.ping_with(target, Vec::new()).await
    }

    pub async fn ping_with(&self, target: &NodeAddress, probe: Vec<u8>) -> Option<PingResponse> {
        let started = Instant::now();
        let response = match self.exchange_ping(target, probe).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "ping failed");
                None
            }
        };
        let now = unix_millis();

        match response {
            Some(response) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                let dossier = &self.ctx.dossier;
                dossier.with_entry(target, &mut |entry| entry.touch(now));
                dossier.record_success(target, Metric::Latency, latency_ms);
                dossier.record_success(target, Metric::Available, 1.0);
                merge_all(self.ctx.publications.as_ref(), response.publications.clone());
                self.ctx.table.add(target.clone());
                Some(response)
            }
            None => {
                let ttl = self.ctx.routing_settings().dossier_ttl;
                self.ctx.dossier.record_failure(target, Metric::Available);
                let stale = self
                    .ctx
                    .dossier
                    .entry(target.id())
                    .filter(|entry| entry.is_stale(ttl, now));
                if let Some(entry) = stale {
                    self.ctx.dossier.remove(target.id());
                    tracing::info!(
                        target = %target,
                        reputation = entry.reputation(),
                        "expired stale dossier entry"
                    );
                }
                None
            }
        }
    }

    async fn exchange_ping(&self, target: &NodeAddress, probe: Vec<u8>) -> Result<PingResponse, RoutingError> {
        let request = Envelope::request(
            self.ctx.local.clone(),
            *target.id(),
            Subject::new(subjects::ROUTING, subjects::PING),
            encode_payload(&PingRequest { probe })?,
        );
        let reply = self.ctx.messages.send(target, &request).await?;
        if !reply.is_ok() {
            return Err(RoutingError::Rejected {
                operation: subjects::PING.into(),
                status: reply.header.status,
            });
        }
        Ok(decode_payload(&reply.payload)?)
    }

    async fn handle_ping(&self, request: Envelope) -> Envelope {
        let local = &self.ctx.local;
        let sender = request.header.source.clone();
        if self.ctx.table.add(sender.clone()) {
            tracing::debug!(peer = %sender, "learned neighbour from ping");
        }

        if let Err(e) = decode_payload::<PingRequest>(&request.payload) {
            tracing::debug!(peer = %sender, error = %e, "malformed ping");
            return request.compose_reply(local, Status::Failed, Bytes::new());
        }

        match self.ctx.route_onward(&request).await {
            Ok(Relay::Root) => {
                let response = PingResponse {
                    neighbours: self.ctx.table.addresses(),
                    publications: self.ctx.publications.snapshot(),
                };
                reply_with(&request, local, &response)
            }
            Ok(Relay::Replied(reply)) => reply,
            Err(e) => failure_reply(&request, local, e),
        }
    }

    // ── Maintenance passes ───────────────────────────────────────────────

    /// Ping every neighbour, drop the silent ones, then ping every address
    /// they told us about that we did not already know.
    pub async fn introduce(&self) -> IntroductionPass {
        let neighbours = self.ctx.table.addresses();
        if neighbours.len() <= 1 {
            return IntroductionPass::TooFewNeighbours;
        }

        let pinged = neighbours.len();
        let answers = futures::future::join_all(neighbours.iter().map(|n| self.ping(n))).await;

        let mut lost = 0;
        let mut discovered = HashSet::new();
        for (neighbour, answer) in neighbours.iter().zip(answers) {
            match answer {
                Some(response) => discovered.extend(response.neighbours),
                None => {
                    if self.ctx.table.remove(neighbour) {
                        lost += 1;
                        tracing::info!(peer = %neighbour, "neighbour did not answer, removed");
                    }
                }
            }
        }

        let local = self.ctx.local.id();
        let fresh: Vec<NodeAddress> = discovered
            .into_iter()
            .filter(|a| a.id() != local && !self.ctx.table.contains(a.id()))
            .collect();
        let added = futures::future::join_all(fresh.iter().map(|a| self.ping(a)))
            .await
            .into_iter()
            .filter(Option::is_some)
            .count();

        tracing::debug!(pinged, lost, added, "introduction pass");
        IntroductionPass::Swept { pinged, lost, added }
    }

    /// Ping every remembered peer that is not a current neighbour.
    pub async fn reunite(&self) -> ReunionPass {
        let local = self.ctx.local.id();
        let candidates: Vec<NodeAddress> = self
            .ctx
            .dossier
            .addresses()
            .into_iter()
            .filter(|a| a.id() != local && !self.ctx.table.contains(a.id()))
            .collect();

        let mut pass = ReunionPass::default();
        for candidate in &candidates {
            pass.attempted += 1;
            if self.ping(candidate).await.is_some() {
                pass.recovered += 1;
            }
        }
        self.ctx.dossier.flush();

        tracing::debug!(attempted = pass.attempted, recovered = pass.recovered, "reunion pass");
        pass
    }
}

#[async_trait]
impl MessageHandler for RoutingProtocol {
    fn service(&self) -> &'static str {
        subjects::ROUTING
    }

    async fn handle(&self, request: Envelope) -> Envelope {
        let operation = request.header.subject.operation.clone();
        match operation.as_str() {
            subjects::JOIN => self.handle_join(request).await,
            subjects::PING => self.handle_ping(request).await,
            other => {
                tracing::warn!(operation = %other, from = %request.header.source, "unknown routing operation");
                request.compose_reply(&self.ctx.local, Status::Failed, Bytes::new())
            }
        }
    }
}

fn reply_with<T: serde::Serialize>(request: &Envelope, local: &NodeAddress, body: &T) -> Envelope {
    match encode_payload(body) {
        Ok(payload) => request.compose_reply(local, Status::Ok, payload),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode reply");
            request.compose_reply(local, Status::Failed, Bytes::new())
        }
    }
}

fn failure_reply(request: &Envelope, local: &NodeAddress, error: RoutingError) -> Envelope {
    let status = match error {
        RoutingError::Unreachable { .. } | RoutingError::Expired => Status::Undeliverable,
        _ => Status::Failed,
    };
    tracing::debug!(from = %request.header.source, error = %error, ?status, "could not route request");
    request.compose_reply(local, status, Bytes::new())
}
