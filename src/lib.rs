pub mod config;
pub mod db;
pub mod ledger;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod remote;
pub mod scheduler;
pub mod settings;
pub mod sync;
