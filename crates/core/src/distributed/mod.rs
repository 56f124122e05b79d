//! Collective layer for data-parallel contrastive training.
//!
//! - [`ProcessGroup`]: rank and world size
//! - [`DeviceCommunicator`]: blocking gather collectives
//!
//! With a world size of 1 every collective is identity, so single-worker
//! callers pay nothing.
//!
//! ```ignore
//! use flmr_core::distributed::{DeviceCommunicator, MockCommunicator};
//!
//! let comm = MockCommunicator::single();
//! assert!(comm.process_group().is_single());
//! ```

mod communicator;
mod error;
mod process_group;

pub use communicator::{DeviceCommunicator, InProcessCommunicator, MockCommunicator};
pub use error::DistributedError;
pub use process_group::{LocalProcessGroup, ProcessGroup};
