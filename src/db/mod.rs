//! The database connection actor (component C1).

pub mod connection;

pub use connection::Connection;
