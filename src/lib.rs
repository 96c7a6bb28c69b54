pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod http;
pub mod ledger;
pub mod lock;
pub mod os;
pub mod segment_file;
pub mod table;
pub mod transaction;
pub mod validate;
