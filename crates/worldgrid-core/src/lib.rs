pub mod config;
pub mod key;
pub mod naming;
pub mod types;

pub use config::GridConfig;
pub use key::{KeyError, WorldKey};
pub use naming::{InstanceClass, Naming};
pub use types::*;
