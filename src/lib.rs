pub mod client;
pub mod cni;
pub mod config;
pub mod http;
pub mod join;
pub mod membership;
pub mod netutil;
pub mod node_state;
pub mod service_args;
pub mod services;
pub mod token;
pub mod version;
