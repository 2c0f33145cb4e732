pub mod accumulator;
pub mod config;
pub mod correlator;
pub mod entry;
pub mod har_export;
pub mod har_import;
pub mod history;
pub mod logging;
pub mod persistence;
pub mod reconcile;
pub mod service;
pub mod storage;
pub mod synthesis;
pub mod transport;
