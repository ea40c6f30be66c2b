//! Language Server Protocol plumbing
//!
//! Wire framing, the typed connection, capability negotiation, process
//! startup and project root resolution. Nothing here decides when a server
//! starts or stops; that belongs to the manager.

pub mod capabilities;
pub mod connection;
pub mod protocol;
pub mod root;
pub mod starter;
pub mod transport;

pub use capabilities::{ChangeMode, SaveMode, SyncBehaviors, WillSaveMode};
pub use connection::{Cancellable, Connection, RequestHandler};
pub use protocol::{path_to_uri, uri_to_path, Position, Range, TextEdit};
pub use root::{normalize_path, MarkerRootResolver, ProjectRootResolver};
pub use starter::{ProcessStarter, ServerProcess, ServerStarter, StartedServer};
pub use transport::{PeerChannels, TransportChannels};
