//! Synchronization primitives built on top of [`tokio::sync`] channels.

pub(crate) mod cq;
