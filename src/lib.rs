pub mod access;
pub mod api;
pub mod config;
pub mod custody;
pub mod error;
pub mod events;
pub mod evidence;
pub mod export;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod notes;
pub mod notification;
pub mod query;
pub mod reputation;
pub mod service;
pub mod signer;
pub mod sled_store;
pub mod store;

pub use error::{CustodyError, CustodyResult};
pub use service::{CustodyService, ServiceOptions};
