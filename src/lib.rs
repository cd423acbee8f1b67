pub mod config;
pub mod consul;
pub mod context;
pub mod convergence;
pub mod remote;
pub mod retry;
pub mod systemd;
pub mod transport;
pub mod vault;
pub mod version;
