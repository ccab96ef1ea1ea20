//! Per-request state machine and the event loop that drives it. This is the
//! server's core: every in-flight request is one entry in a [`Slab`], keyed by
//! the [`Tag`] its pending operation was submitted with, and the loop advances
//! whichever entry each completion event names. One instance has at most one
//! outstanding operation at a time, so no two transitions of the same
//! instance can ever race.
//!
//! Lifecycle of an instance:
//!
//! ```text
//! +------------------+  (tag, ok)   +------------+  (tag, _)
//! | AwaitingRequest  | -----------> | Completing | -----------> released
//! +------------------+              +------------+
//!         |
//!         | arms a fresh sibling before the reply is produced,
//!         | so an incoming request never finds the server deaf
//!         v
//! +------------------+
//! | AwaitingRequest  |
//! +------------------+
//! ```
//!
//! A failed request-wait event only happens while the transport is shutting
//! down: the instance is released without spawning a sibling. A failed
//! reply-send still releases the instance, resources are freed on every exit
//! path.

use slab::Slab;
use tokio::sync::{mpsc, oneshot};

use crate::{
    proto::{HelloReply, HelloRequest, RpcStatus},
    sync::cq::{CompletionQueue, CqHandle, Event, Tag},
};

/// An incoming request matched to a waiting instance, along with the means to
/// answer it.
pub(crate) struct IncomingCall {
    /// The decoded request.
    pub request: HelloRequest,

    /// Write-side handle bound to the connection the request arrived on.
    pub responder: Responder,
}

/// Submits the reply for delivery on the connection that produced the call.
/// The actual write happens on the connection's writer task, which posts the
/// `(tag, ok)` completion once the frame is on the wire (or failed to be).
pub(crate) struct Responder {
    call_id: u64,
    writer: mpsc::UnboundedSender<ReplyOp>,
    cq: CqHandle,
}

impl Responder {
    pub fn new(call_id: u64, writer: mpsc::UnboundedSender<ReplyOp>, cq: CqHandle) -> Self {
        Self {
            call_id,
            writer,
            cq,
        }
    }

    /// Fire-and-forget reply submission, tagged with the instance that owns
    /// it. If the connection writer is already gone the operation completes
    /// immediately as failed, so the instance is still released.
    pub fn finish(self, reply: HelloReply, status: RpcStatus, tag: Tag) {
        let op = ReplyOp {
            tag,
            call_id: self.call_id,
            status,
            reply,
        };

        if let Err(mpsc::error::SendError(op)) = self.writer.send(op) {
            self.cq.post(op.tag, false);
        }
    }
}

/// One reply waiting to be serialized by a connection writer task.
pub(crate) struct ReplyOp {
    pub tag: Tag,
    pub call_id: u64,
    pub status: RpcStatus,
    pub reply: HelloReply,
}

/// Registered interest in the next unmatched incoming request. The dispatcher
/// fills `cell` and only then posts `(tag, true)`, so by the time the event
/// loop sees the completion the call is guaranteed to be there.
pub(crate) struct RequestSlot {
    pub tag: Tag,
    pub cell: oneshot::Sender<IncomingCall>,
}

/// The asynchronous greeter service as seen by the state machine: the only
/// operation it offers is "give me the next request, eventually".
pub(crate) struct GreeterService {
    slots: mpsc::UnboundedSender<RequestSlot>,
}

impl GreeterService {
    pub fn new(slots: mpsc::UnboundedSender<RequestSlot>) -> Self {
        Self { slots }
    }

    /// Arms a request-wait operation tagged with `tag`. Never blocks. The
    /// returned receiver is filled strictly before the completion event for
    /// `tag` is posted.
    pub fn request_call(&self, tag: Tag) -> oneshot::Receiver<IncomingCall> {
        let (cell, incoming) = oneshot::channel();

        // If the dispatcher is gone the queue is shutting down and the event
        // loop will terminate on its own; the slot is simply never signaled.
        let _ = self.slots.send(RequestSlot { tag, cell });

        incoming
    }
}

/// Lifecycle state of one request instance. Each variant carries exactly the
/// data that is valid in that state.
enum CallState {
    /// Waiting for the next incoming request.
    AwaitingRequest {
        incoming: oneshot::Receiver<IncomingCall>,
    },

    /// Reply submitted, waiting for the delivery completion.
    Completing,
}

/// Server event loop. Bootstraps one instance and then advances state
/// machines until the completion queue shuts down. This is the queue's only
/// consumer; it keeps no bookkeeping besides the slab that the tags index.
pub(crate) async fn drive(mut cq: CompletionQueue, service: GreeterService, log_name: String) {
    let mut calls: Slab<CallState> = Slab::new();

    arm(&mut calls, &service, &log_name);

    while let Some(Event { tag, ok }) = cq.next().await {
        let key = tag.key();

        let Some(entry) = calls.get_mut(key) else {
            eprintln!("{log_name} => Stray completion event for call {tag}");
            continue;
        };

        // The processing transition below leaves the instance in Completing,
        // which is what the placeholder already says.
        match std::mem::replace(entry, CallState::Completing) {
            CallState::AwaitingRequest { mut incoming } => {
                if !ok {
                    // Request-wait only fails when the transport is shutting
                    // down. Don't arm a sibling, nobody would signal it.
                    calls.remove(key);
                    cq.close();
                    println!("{log_name} => Call {tag} cancelled, shutting down");
                    continue;
                }

                // Arm the sibling first so the server keeps a waiting slot
                // for the next request while this one is being answered.
                arm(&mut calls, &service, &log_name);

                let Ok(call) = incoming.try_recv() else {
                    calls.remove(key);
                    eprintln!("{log_name} => Call {tag} signaled without a request");
                    continue;
                };

                let reply = HelloReply {
                    message: format!("Hello {}", call.request.name),
                };

                call.responder.finish(reply, RpcStatus::ok(), tag);
                println!("{log_name} => Call {tag} processing, reply submitted");
            }

            CallState::Completing => {
                // Terminal state, whether the reply made it out or not.
                calls.remove(key);
                println!("{log_name} => Call {tag} finished, released");
            }
        }
    }
}

/// Creates a fresh instance in its initial state. The slab key the instance
/// lands on is the tag of every operation it will ever submit.
fn arm(calls: &mut Slab<CallState>, service: &GreeterService, log_name: &str) -> Tag {
    let entry = calls.vacant_entry();
    let tag = Tag::from_key(entry.key());

    let incoming = service.request_call(tag);
    entry.insert(CallState::AwaitingRequest { incoming });

    println!("{log_name} => Call {tag} created, awaiting request");

    tag
}
