// ── deliver-scp / delivery module ─────────────────────────────────────────────
//
// Remote file delivery orchestration:
//   • PathResolver: source spec → transfer plan
//   • RemotePathBuilder: base dir + subdir token → remote destination
//   • DeliveryTransport: mkdir / upload / list over one SSH session
//   • TransferOrchestrator: sequences the above into one TransferOutcome

pub mod types;
pub mod error;
pub mod progress;
pub mod resolver;
pub mod remote_path;
pub mod transport;
pub mod ssh;
pub mod openssh;
pub mod orchestrator;

pub use types::*;
pub use error::{DeliveryError, DeliveryResult};
pub use progress::{ChannelSink, CollectingSink, LogSink, ProgressSink};
pub use resolver::resolve;
pub use remote_path::{build_destination, validate_subdir_token};
pub use transport::{shell_escape, DeliveryTransport, TransportConnector};
pub use ssh::{Ssh2Connector, Ssh2Transport};
pub use openssh::{OpenSshConnector, OpenSshTransport};
pub use orchestrator::{DeliveryOptions, DeliveryRequest, TransferOrchestrator};
