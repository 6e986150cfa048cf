//! Concurrency primitives shared by the database actor (components C2, C3).

pub mod observer;
pub mod semaphore;

pub use observer::{ChangeEvent, ChangeKind, Observer};
pub use semaphore::ReentrantSemaphore;
