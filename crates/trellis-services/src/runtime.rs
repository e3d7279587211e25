//! Node assembly.
//!
//! `launch` binds the listener, builds the collaborators and the connector,
//! registers the routing protocol with the dispatcher, and starts serving.
//! Routing maintenance is created but left to the caller to start, so a node
//! can join its gateway first.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use trellis_core::config::{ConnectionType, TrellisConfig};
use trellis_core::crypto::Keypair;
use trellis_core::message::JoinResponse;
use trellis_core::{Key, NodeAddress, NodeId};

use crate::census::MemoryCensus;
use crate::connector::Connector;
use crate::daemons::RoutingService;
use crate::dossier::{Dossier, MemoryDossier};
use crate::establish::for_connection_type;
use crate::node::{Node, NodeContext, RoutingError, ServiceDispatcher};
use crate::publications::MemoryPublicationIndex;
use crate::routing::RoutingProtocol;
use crate::settings::{RoutingSettings, TransportSettings};
use crate::table::FlatNeighbourTable;
use crate::transport::MessageService;

#[derive(Clone)]
pub struct NodeOptions {
    pub listen_addr: SocketAddr,
    /// Endpoint peers should dial. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    pub admin_addr: Option<SocketAddr>,
    /// Explicit id. Must match the keypair when one is given.
    pub id: Option<NodeId>,
    pub keypair: Option<Arc<Keypair>>,
    pub network_id: String,
    pub transport: TransportSettings,
    pub routing: RoutingSettings,
    pub dossier_path: Option<PathBuf>,
    pub publication_capacity: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_addr: None,
            admin_addr: None,
            id: None,
            keypair: None,
            network_id: "trellis".to_string(),
            transport: TransportSettings::default(),
            routing: RoutingSettings::default(),
            dossier_path: None,
            publication_capacity: 10_000,
        }
    }
}

impl NodeOptions {
    pub fn from_config(config: &TrellisConfig, keypair: Arc<Keypair>) -> Result<Self> {
        let transport = TransportSettings::from(&config.transport);
        let id = match (&config.node.id, transport.connection_type) {
            (Some(hex), ConnectionType::Plain) => {
                Some(hex.parse::<Key>().with_context(|| format!("invalid node id {hex:?}"))?)
            }
            (Some(_), ConnectionType::Encrypted) => {
                tracing::warn!("ignoring configured node id; encrypted nodes derive it from the keypair");
                None
            }
            (None, _) => None,
        };
        Ok(Self {
            listen_addr: config.node.listen_addr,
            advertise_addr: config.node.advertise_addr,
            admin_addr: config.node.admin_addr,
            id,
            keypair: Some(keypair),
            network_id: config.node.network_id.clone(),
            transport,
            routing: RoutingSettings::from(&config.routing),
            dossier_path: config.routing.dossier_path.clone(),
            publication_capacity: config.routing.publication_capacity,
        })
    }

    fn resolve_id(&self) -> Result<NodeId> {
        let derived = self.keypair.as_ref().map(|kp| NodeId::from_public_key(&kp.public));
        match (self.id, derived) {
            (Some(id), Some(derived)) if id != derived && self.transport.connection_type == ConnectionType::Encrypted => {
                bail!("node id {id} does not match keypair id {derived}")
            }
            (Some(id), _) => Ok(id),
            (None, Some(derived)) => Ok(derived),
            (None, None) => Ok(Key::random()),
        }
    }
}

pub struct RunningNode {
    context: Arc<NodeContext>,
    protocol: Arc<RoutingProtocol>,
    maintenance: RoutingService,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<Result<()>>,
}

/// Build a node from `options` and start accepting connections.
pub async fn launch(options: NodeOptions) -> Result<RunningNode> {
    let id = options.resolve_id()?;
    let establish = for_connection_type(options.transport.connection_type, options.keypair.clone())
        .context("failed to set up connection strategy")?;

    let listener = TcpListener::bind(options.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", options.listen_addr))?;
    let bound = listener.local_addr()?;
    let mut local = NodeAddress::new(id, options.advertise_addr.unwrap_or(bound));
    if let Some(admin) = options.admin_addr {
        local = local.with_admin(admin);
    }

    let dossier: Arc<dyn Dossier> = match options.dossier_path {
        Some(path) => Arc::new(MemoryDossier::with_persistence(path)),
        None => Arc::new(MemoryDossier::new()),
    };
    let connector = Connector::new(establish, options.transport);
    let context = Arc::new(NodeContext {
        table: Arc::new(FlatNeighbourTable::new(local.clone())),
        local: local.clone(),
        network_id: options.network_id,
        dossier,
        publications: Arc::new(MemoryPublicationIndex::new(options.publication_capacity)),
        census: Arc::new(MemoryCensus::new()),
        messages: MessageService::new(connector.clone()),
        routing: Arc::new(RwLock::new(options.routing)),
    });

    let protocol = Arc::new(RoutingProtocol::new(context.clone()));
    let mut dispatcher = ServiceDispatcher::new();
    dispatcher.register(protocol.clone());
    let node = Arc::new(Node::new(context.clone(), dispatcher));

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(connector.serve(listener, node, shutdown_rx));

    tracing::info!(node = %local, network = %context.network_id, "node up");
    Ok(RunningNode {
        maintenance: RoutingService::new(protocol.clone()),
        context,
        protocol,
        shutdown,
        server,
    })
}

impl RunningNode {
    pub fn address(&self) -> &NodeAddress {
        &self.context.local
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn connector(&self) -> &Arc<Connector> {
        self.context.messages.connector()
    }

    pub fn protocol(&self) -> &Arc<RoutingProtocol> {
        &self.protocol
    }

    pub fn maintenance(&self) -> &RoutingService {
        &self.maintenance
    }

    pub fn maintenance_mut(&mut self) -> &mut RoutingService {
        &mut self.maintenance
    }

    pub async fn join(&self, gateway: &NodeAddress) -> Result<Option<JoinResponse>, RoutingError> {
        self.protocol.join(gateway).await
    }

    /// Stop maintenance, stop accepting, and persist the dossier.
    pub async fn shutdown(mut self) -> Result<()> {
        self.maintenance.stop().await;
        let _ = self.shutdown.send(());
        let served = self.server.await.context("connector task failed")?;
        self.context.messages.connector().pool().close();
        self.context.dossier.flush();
        tracing::info!(node = %self.context.local, "node down");
        served
    }
}
