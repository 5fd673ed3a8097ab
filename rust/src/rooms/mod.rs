pub mod broker;
pub mod bus;
pub mod membership;
pub mod protocol;
pub mod reliability;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod store;
