pub mod audit_cache;
pub mod config;
pub mod cycle;
pub mod exclude;
pub mod journal;
pub mod layout;
pub mod maintenance;
pub mod mover;
pub mod ondeck;
pub mod scan;
pub mod store;
pub mod timestamps;
pub mod util;
pub mod warn;
