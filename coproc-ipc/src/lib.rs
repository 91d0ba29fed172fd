pub mod channel;
pub mod config;
pub mod control;
pub mod doorbell;
pub mod firmware;
pub mod layout;
pub mod position;
pub mod region;
pub mod registry;
pub mod sim;
pub mod snapshot;
pub mod table;
pub mod transport;

pub use channel::{CancelToken, IoError};
pub use config::{ConfigError, MethodSignature, TransportConfig};
pub use control::{ControlBlock, LinkState};
pub use doorbell::{Doorbell, Mailbox};
pub use firmware::{BootControl, FirmwareError, FirmwareImage};
pub use position::StreamPosition;
pub use region::{RegionError, SharedRegion};
pub use registry::{
    AcquireError, ConsumerId, RegisterError, ReleaseError, ServiceDriver, ServiceHandle,
};
pub use snapshot::TransportSnapshot;
pub use table::{Direction, DiscoveryError, ServiceDescriptor};
pub use transport::Transport;
