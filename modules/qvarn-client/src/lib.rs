pub mod client;
pub mod error;
pub mod search;
pub mod store;

pub use client::{QvarnClient, QvarnClientConfig};
pub use error::{optional, Result, StoreError};
pub use search::{QueryValue, SearchQuery};
pub use store::{Resource, Store, STATUS_CHECK_ID};
