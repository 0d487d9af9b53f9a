pub mod command;
pub mod rate_limit;
pub mod rpc;
pub mod service;
