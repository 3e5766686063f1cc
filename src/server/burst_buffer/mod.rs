pub mod config;
pub mod pack;
pub mod pools;
pub mod state;
pub mod units;

pub use config::{load_config, BbConfig};
pub use state::{BbAlloc, BbAllocState, BbGres, BbState, BbUser, TermSignal};

/// Sentinel for "value not configured".
pub const NO_VAL: u32 = 0xffff_fffe;
