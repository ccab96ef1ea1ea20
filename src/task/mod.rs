//! Tokio tasks that make up both sides of the exchange. Since we're working
//! with [`tokio`], processing units are tasks, not threads: the server spawns
//! one task per connection plus a dispatcher and the event loop, the client
//! spawns a reader and a writer next to the issuing task. Shared state is
//! synchronized mostly through message passing; the completion queue in
//! `crate::sync::cq` is the channel everything funnels into.

pub(crate) mod call;
pub(crate) mod client;
pub(crate) mod server;
