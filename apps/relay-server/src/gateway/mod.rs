pub mod events;
pub mod fanout;
pub mod heartbeat;
pub mod origin;
pub mod polling;
pub mod registry;
pub mod server;
