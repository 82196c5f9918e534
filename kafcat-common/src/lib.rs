//! Multi-partition fan-in consumption engine.
//!
//! A session resolves starting offsets, opens one [`reader::PartitionReader`]
//! per partition, merges their streams through [`merger::FanInMerger`] and
//! writes the filtered, formatted result to a sink until the
//! [`shutdown::ShutdownCoordinator`] reports the readers drained.

pub mod broker;
pub mod error;
pub mod merger;
pub mod offset;
pub mod output;
pub mod reader;
pub mod session;
pub mod shutdown;
pub mod test_utils;
