//! Foundation layer of the nexio networking framework.
//!
//! Provides the reactor [`Service`] that owns the worker loops, the
//! [`Timer`] primitive, per-endpoint identity/state/statistics/options, the
//! double-buffered [`SendQueue`] and growable [`ReceiveBuffer`] used by the
//! stream transports, the [`HandlerStorage`] scratch arena, and the error
//! taxonomy shared by every transport crate.

pub mod error;
pub mod id;
pub mod options;
pub mod queue;
pub mod recv;
pub mod resolver;
pub mod service;
pub mod state;
pub mod stats;
pub mod storage;
pub mod timer;

pub use error::{Error, Result, is_benign_disconnect, is_benign_tls_disconnect};
pub use id::EndpointId;
pub use options::EndpointOptions;
pub use queue::{Enqueue, SendQueue, WireEvent};
pub use recv::{DEFAULT_RECEIVE_CAPACITY, ReceiveBuffer};
pub use resolver::{DnsResolver, Resolver};
pub use service::{DefaultServiceHandler, Service, ServiceConfig, ServiceHandler};
pub use state::{AtomicEndpointState, EndpointState};
pub use stats::{EndpointStats, StatsSnapshot};
pub use storage::{HANDLER_BLOCK_SIZE, HandlerBuffer, HandlerStorage};
pub use timer::{Timer, TimerAction, TimerHandler};
