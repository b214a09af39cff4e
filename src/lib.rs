pub mod config;
pub mod idler;
pub mod keys;
pub mod locks;
pub mod metrics;
pub mod oracle;
pub mod reconciler;
pub mod store;
pub mod unidler;
pub mod utils;
