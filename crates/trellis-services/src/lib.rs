//! trellis-services — transport, collaborators, and routing maintenance.

pub mod census;
pub mod channel;
pub mod connector;
pub mod daemons;
pub mod dossier;
pub mod establish;
pub mod node;
pub mod pool;
pub mod publications;
pub mod routing;
pub mod runtime;
pub mod settings;
pub mod socket_cache;
pub mod table;
pub mod transport;

pub use census::{Census, MemoryCensus};
pub use connector::{Connector, LocalDelivery};
pub use daemons::{DaemonPhase, DaemonStatus, IntroductionRamp, RoutingService};
pub use dossier::{Dossier, DossierEntry, MemoryDossier, Metric};
pub use node::{MessageHandler, Node, NodeContext, RoutingError, ServiceDispatcher};
pub use publications::{MemoryPublicationIndex, PublicationIndex};
pub use routing::{IntroductionPass, ReunionPass, RoutingProtocol};
pub use runtime::{launch, NodeOptions, RunningNode};
pub use settings::{RoutingSettings, TransportSettings};
pub use socket_cache::{CacheStats, SocketCache};
pub use table::{FlatNeighbourTable, NeighbourTable};
pub use transport::{FailureClass, MessageService, RetryBudget, TransportError};
