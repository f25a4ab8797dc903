#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Sharded execution of functions under auto-parallel.
//!
//! A [`Shard`] site binds a function to a distribution strategy and hands back a
//! [`ShardFn`] closure. Asking the same site again for the same function and an equal
//! [`StrategyDescriptor`] returns the cached closure; anything else builds a new one.
//! Calling the closure goes through a per-function [`GraphFunction`] into a
//! [`GraphExecutor`], which compiles and runs the graph.
//!
//! The entry point validates the ambient [`ContextService`] (eager mode, `auto_parallel`,
//! `sharding_propagation`, an Ascend or GPU target) and the arguments in [`ShardArgs`]
//! before touching any state.

mod context;
mod error;
mod function;
mod host;
mod jit;
mod shard;
mod strategy;
mod tensor;
mod value;

pub mod sharding;

pub use context::*;
pub use error::*;
pub use function::*;
pub use host::*;
pub use jit::*;
pub use shard::*;
pub use strategy::*;
pub use tensor::*;
pub use value::*;

pub use sharding::Layout;
