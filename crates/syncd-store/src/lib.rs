//! Reference history store for syncd.
//!
//! One [`FileHistoryStore`] manages the append-only sync history of one
//! realm file. The history and the client-file registry are kept in
//! memory and snapshotted as JSON into the `.realm` file after every
//! produced version, which is all the durability the server core asks of
//! a store. [`FileHistoryFactory`] implements the core's `HistoryFactory`
//! port.

mod history;
mod snapshot;

pub use history::{FileHistoryFactory, FileHistoryStore};
