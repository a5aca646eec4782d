//! mbroker - message broker module host
//!
//! Broker-side subsystem that hosts dynamically loaded service modules.
//! Each module runs on its own OS thread with a private bidirectional
//! channel to the broker reactor; the host rewrites route stacks and
//! credentials so the point-to-point channel behaves like a ROUTER/DEALER
//! pair, and drives the module lifecycle (INIT → RUNNING → FINALIZING →
//! EXITED) through an ordered shutdown handshake.
//!
//! ## Design principles
//!
//! 1. **Crash containment**: a failed module surfaces as an EXITED record
//!    with a nonzero errnum; nothing here aborts the broker.
//! 2. **Read-only sharing**: record fields read by the module thread are
//!    frozen before the thread starts; the channel is the only
//!    cross-thread mutable object.
//! 3. **Drain, don't preempt**: shutdown is a handshake plus a drain of
//!    residual requests, never a mid-request preemption.

pub mod config;
pub mod module;

pub use config::{AttrTable, BrokerConfig};
pub use module::{
    Message, MessageType, Module, ModuleError, ModuleHandle, ModuleManager, ModuleStatus,
    ServiceRegistry,
};
