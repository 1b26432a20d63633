//! # cohort-server
//!
//! The server side of the Cohort consensus library: the role state
//! machine (Inactive, Reserve, Passive, Follower, Candidate, Leader),
//! the leader's replication pipeline, the client session layer, and the
//! state-machine executor that applies committed entries identically on
//! every replica.
//!
//! Applications implement [`StateMachine`] and hand it to a [`Server`],
//! which either bootstraps a new cluster or joins an existing one:
//!
//! ```ignore
//! let member = Member::new(1, MemberType::Active, server_addr, client_addr);
//! let server = Server::bootstrap(
//!     member,
//!     Vec::new(),
//!     ServerConfig::default(),
//!     StorageConfig::new("cohort", "/var/lib/cohort"),
//!     MyMachine::new(),
//! )
//! .await?;
//! server.run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// The leader's replication driver
pub mod appender;
/// Cluster membership state
pub mod cluster;
/// Server timing configuration
pub mod config;
/// The server core and role state machine
pub mod context;
/// The state-machine executor
pub mod executor;
/// The client request plane
mod request;
/// Role-specific message handlers
mod role;
/// The server event loop
pub mod server;
/// Client sessions
pub mod session;
/// The replicated state machine interface
pub mod state_machine;
/// Server-to-server transport
pub mod transport;

pub use config::ServerConfig;
pub use context::{ClientEffect, Role, ServerContext};
pub use executor::{StateMachineExecutor, SNAPSHOT_INTERVAL_MS, STATE_MACHINE_ID};
pub use server::Server;
pub use session::{Session, SessionManager, SessionRegistry};
pub use state_machine::{Commit, OperationKind, OperationRouter, StateMachine};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
