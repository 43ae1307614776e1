//! Document store: the spec's excluded database collaborator, implemented
//! as sqlite-backed collections (see [`store`]) fronted by an in-process
//! change feed (see [`change_feed`]) that mimics a change-stream for the
//! watchers, reconciler, and worker to subscribe to.

mod change_feed;
mod dynamic;
mod model;
mod store;

pub use change_feed::{ChangeEvent, ChangeFeed, Collection, Operation};
pub use dynamic::{DynamicDb, DynamicDbError, DynamicDbResult};
pub use model::*;
pub use store::{Db, DbError, DbResult};
