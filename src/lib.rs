pub mod aggregate;
pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod index;
pub mod matcher;
pub mod mera;
pub mod output;
pub mod resolver;
pub mod store;
pub mod transfer;
pub mod transport;
