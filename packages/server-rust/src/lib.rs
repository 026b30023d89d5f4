//! `busrpc` Server — handler-tree dispatch over a topic broker, with an HTTP binding.

pub mod broker;
pub mod http;
pub mod service;

pub use broker::{Broker, BrokerChannel, BrokerError, Delivery, MemoryBroker};
pub use http::{GatewayError, HttpGateway};
pub use service::{
    current_transaction_id, handler, sync_handler, with_transaction, DispatchError, HandlerFn,
    HandlerNode, HandlerNotFound, HandlerResult, HandlerTree, ListenError, ListenTarget, Service,
    ServiceConfig,
};
