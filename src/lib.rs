pub mod cache;
pub mod collab;
pub mod config;
pub mod dag;
pub mod errors;
pub mod events;
pub mod feature;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod retry;
pub mod store;
pub mod util;
