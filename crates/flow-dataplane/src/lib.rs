pub mod alias;
pub mod clock;
pub mod config;
pub mod engine;
pub mod reservoir;
pub mod shm;
pub mod stats;
pub mod table;
pub mod tcp;

pub use config::DataplaneConfig;
pub use engine::{Dispatch, VipDataplane};
pub use shm::{unlink_vip, ConsumerEndpoint, ShmRegion, VipShm, VipState};
pub use stats::{AliasEntry, AsStat, MsgIn, MsgOut, AS_MAX};
pub use table::{Bucket, FlowTable, Lookup};
pub use tcp::{PacketClass, PacketInfo};
