//! Resource model shared with the observation source.
//!
//! - `GameDeployment`: desired spec (operator-owned) and status (controller-owned)
//! - `WorkloadInstance`: a running unit labeled with its revision and identity
//! - `Revision`: immutable template snapshot with a sequence number
//! - `HookRun`: externally executed verification task

mod deployment;
mod hook;
mod instance;
mod meta;
mod revision;

pub use deployment::*;
pub use hook::*;
pub use instance::*;
pub use meta::*;
pub use revision::*;
