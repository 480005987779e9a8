pub mod aggregation;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod event;
pub mod operators;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod signing;
pub mod types;
