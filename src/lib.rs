pub mod broker;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod endpoint;
pub mod error;
pub mod node;
pub mod rpc;
pub mod shutdown;
pub mod timer;
pub mod worker;
