mod helpers;

mod async_ops;
mod auth;
mod config_file;
mod failover;
mod records;
mod shared_memory;
