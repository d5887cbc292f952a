//! Device protocol decoding, position normalization and trip aggregation
//! for fleet trackers.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod geocode;
pub mod normalize;
pub mod protocol;
pub mod replay;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod trip;
pub mod types;

pub use config::Config;
pub use dispatch::{DispatchHandle, Dispatcher, Record};
pub use error::{FrameError, Rejection, TrackerError};
pub use protocol::Protocol;
pub use session::{DeviceSession, Link, SessionRegistry, SessionSettings};
pub use storage::{MemoryGateway, SqliteGateway, StorageGateway};
pub use types::{Device, Position, Stats, Trip};
