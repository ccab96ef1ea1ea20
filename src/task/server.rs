//! The greeter server. The [`Server`] struct owns the listening socket and
//! wires three kinds of tasks together around one completion queue:
//!
//! ```text
//!                      +----------+
//!                      | Acceptor | --- spawns per connection ---+
//!                      +----------+                              |
//!                           |                       +--------------------+
//!                  IncomingCall stream              |  reader  |  writer |
//!                           v                       +--------------------+
//!                     +------------+   fills slot,     |            |
//!                     | Dispatcher |   posts event     |  posts (tag, ok)
//!                     +------------+ ------+           |  after each write
//!                           ^              v           v
//!               RequestSlot |        +------------------------+
//!                           +------- |    Completion queue    |
//!                                    +------------------------+
//!                                                |
//!                                                v
//!                                    +------------------------+
//!                                    | Event loop (call::drive)|
//!                                    +------------------------+
//! ```
//!
//! The event loop is the queue's only consumer and drives one state machine
//! per in-flight request (see [`super::call`]). Readers, the writer tasks and
//! the dispatcher only ever produce events; none of them blocks on
//! submission.

use std::{future::Future, io, net::SocketAddr, pin::Pin};

use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpSocket,
    },
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::{
    config,
    proto::{
        wire::{Frame, MAX_FRAME_SIZE},
        HelloReply, RpcStatus,
    },
    sync::cq::{CompletionQueue, CqHandle},
    task::call::{self, GreeterService, IncomingCall, ReplyOp, RequestSlot, Responder},
};

/// One greeter server instance. Accepts connections, feeds decoded requests
/// into the dispatcher and lets the event loop answer them. In order to
/// terminate cleanly the server stops accepting, tears the connection tasks
/// down and then waits for the event loop to drain the completion queue.
pub struct Server {
    /// State updates channel. Subscribers can use this to check the current
    /// [`State`] of this server.
    state: watch::Sender<State>,

    /// TCP listener used to accept connections.
    listener: TcpListener,

    /// Configuration for this server.
    config: config::Server,

    /// Socket address used by this server to listen for incoming connections.
    address: SocketAddr,

    /// Shutdown future, this can be anything, which allows us to easily write
    /// integration tests. When this future completes, the server starts the
    /// shutdown process.
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Represents the current state of the server.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    /// Server has started but is not accepting connections yet.
    Starting,

    /// Server is accepting incoming connections.
    Listening,

    /// Server received the shutdown signal and is draining its event loop.
    ShuttingDown,

    /// Shutdown process complete.
    Terminated,
}

impl Server {
    /// Initializes a [`Server`] with the given `config`. This process makes
    /// sure that the listening address can be used and configures a socket
    /// for that address, but does not accept connections yet. In order to
    /// process incoming requests, [`Server::run`] must be called and
    /// `await`ed. We do it this way because we use the port 0 for integration
    /// tests, which allows the OS to pick any available port, but we still
    /// want to know which port the server is using.
    pub fn init(config: config::Server) -> Result<Self, io::Error> {
        let (state, _) = watch::channel(State::Starting);

        let socket = if config.listen.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        #[cfg(not(windows))]
        socket.set_reuseaddr(true)?;

        socket.bind(config.listen)?;

        let listener = socket.listen(1024)?;

        // If the TCP port is 0 then the OS will choose a valid one.
        let address = listener.local_addr()?;

        // Don't shutdown on anything by default. CTRL-C will forcefully kill
        // the process, which is how the reference server terminates too.
        let shutdown = Box::pin(std::future::pending());

        Ok(Self {
            state,
            listener,
            config,
            address,
            shutdown,
        })
    }

    /// The [`Server`] will poll the given `future` and whenever it completes,
    /// the shutdown process starts. This is mainly used by the integration
    /// tests; the binary runs with the default pending future.
    pub fn shutdown_on(mut self, future: impl Future + Send + 'static) -> Self {
        self.shutdown = Box::pin(async move {
            future.await;
        });

        self
    }

    /// Address of the listening socket. This is necessary for obtaining the
    /// actual address in cases port 0 was used.
    pub fn socket_address(&self) -> SocketAddr {
        self.address
    }

    /// By subscribing to this server the caller obtains a channel where the
    /// current state of the server can be read. This allows the server and
    /// caller to run on separate Tokio tasks while still allowing the caller
    /// to read the state.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// This is the entry point, by calling and `await`ing this function the
    /// server starts to process requests.
    pub async fn run(self) -> Result<(), crate::Error> {
        let Self {
            state,
            listener,
            config,
            address,
            shutdown,
        } = self;

        let log_name = if let Some(ref name) = config.name {
            format!("{address} ({name})")
        } else {
            address.to_string()
        };

        state.send_replace(State::Listening);
        println!("{log_name} => Listening for requests");

        let (cq, cq_handle) = CompletionQueue::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::task::spawn(dispatch(slot_rx, incoming_rx, cq_handle.clone()));

        let event_loop = tokio::task::spawn(call::drive(
            cq,
            GreeterService::new(slot_tx),
            log_name.clone(),
        ));

        let mut acceptor = Acceptor {
            listener,
            incoming: incoming_tx,
            cq: cq_handle,
            connections: JoinSet::new(),
            log_name: log_name.clone(),
        };

        tokio::select! {
            result = acceptor.accept() => {
                if let Err(err) = result {
                    println!("{log_name} => Error while accepting connections: {err}");
                }
            }
            _ = shutdown => {
                println!("{log_name} => Received shutdown signal");
            }
        }

        // Dropping the acceptor closes the listening socket, aborts every
        // connection task and releases their completion handles. The
        // dispatcher then fails the armed request slot, which makes the event
        // loop shut the queue down, drain it and terminate.
        drop(acceptor);
        state.send_replace(State::ShuttingDown);

        event_loop.await?;
        dispatcher.await?;

        state.send_replace(State::Terminated);
        println!("{log_name} => Shutdown complete");

        Ok(())
    }
}

/// Matches armed request slots to incoming calls, both in arrival order.
/// Filling the slot strictly before posting the completion event is what
/// guarantees the event loop always finds the request it was signaled for.
async fn dispatch(
    mut slots: mpsc::UnboundedReceiver<RequestSlot>,
    mut incoming: mpsc::UnboundedReceiver<IncomingCall>,
    cq: CqHandle,
) {
    while let Some(slot) = slots.recv().await {
        match incoming.recv().await {
            Some(call) => {
                if slot.cell.send(call).is_ok() {
                    cq.post(slot.tag, true);
                } else {
                    cq.post(slot.tag, false);
                }
            }

            // The acceptor is gone, no request will ever match this slot.
            // Failing it tells the state machine not to arm a sibling.
            None => {
                cq.post(slot.tag, false);
                break;
            }
        }
    }
}

/// Listens for incoming connections and spawns a reader and a writer task for
/// each one. Owns all of them: dropping the acceptor aborts every connection.
struct Acceptor {
    /// Underlying TCP listener. We take ownership of this so that when this
    /// struct is dropped the socket is also dropped and we stop accepting
    /// connections.
    listener: TcpListener,

    /// Where decoded requests are sent, shared by all connection readers.
    incoming: mpsc::UnboundedSender<IncomingCall>,

    /// Producer handle cloned into every connection task.
    cq: CqHandle,

    /// Reader and writer tasks of the accepted connections.
    connections: JoinSet<()>,

    /// Prefix for log messages.
    log_name: String,
}

impl Acceptor {
    async fn accept(&mut self) -> Result<(), crate::Error> {
        loop {
            let (stream, client_addr) = self.listener.accept().await?;
            println!("{} => Connection from {client_addr}", self.log_name);

            let (reader, writer) = stream.into_split();
            let (replies_tx, replies_rx) = mpsc::unbounded_channel();

            self.connections
                .spawn(write_replies(writer, replies_rx, self.cq.clone()));

            self.connections.spawn(read_requests(
                reader,
                self.incoming.clone(),
                replies_tx,
                self.cq.clone(),
                client_addr,
                self.log_name.clone(),
            ));
        }
    }
}

/// Connection reader: decodes request frames and hands them to the
/// dispatcher, each one bundled with a responder bound to this connection.
async fn read_requests(
    mut reader: OwnedReadHalf,
    incoming: mpsc::UnboundedSender<IncomingCall>,
    replies: mpsc::UnboundedSender<ReplyOp>,
    cq: CqHandle,
    client_addr: SocketAddr,
    log_name: String,
) {
    loop {
        match Frame::read_from(&mut reader).await {
            Ok(Some(Frame::Request { call_id, request })) => {
                let responder = Responder::new(call_id, replies.clone(), cq.clone());

                if incoming.send(IncomingCall { request, responder }).is_err() {
                    break;
                }
            }

            Ok(Some(Frame::Reply { .. })) => {
                eprintln!("{log_name} => {client_addr} sent a reply frame, closing");
                break;
            }

            // Client hung up cleanly.
            Ok(None) => break,

            Err(err) => {
                eprintln!("{log_name} => Error reading from {client_addr}: {err}");
                break;
            }
        }
    }
}

/// Connection writer: serializes replies in submission order and posts the
/// delivery completion for each one, successful or not.
async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<ReplyOp>,
    cq: CqHandle,
) {
    while let Some(op) = replies.recv().await {
        let tag = op.tag;

        let mut frame = Frame::Reply {
            call_id: op.call_id,
            status: op.status,
            reply: op.reply,
        };

        // A reply too big for a frame would be rejected by the peer's reader,
        // taking the whole multiplexed connection down with it. The call
        // fails with an error status instead and the connection lives on.
        if frame.encoded_len() > MAX_FRAME_SIZE {
            frame = Frame::Reply {
                call_id: op.call_id,
                status: RpcStatus {
                    code: RpcStatus::RESOURCE_EXHAUSTED,
                    message: String::from("reply exceeds the frame size limit"),
                },
                reply: HelloReply {
                    message: String::new(),
                },
            };
        }

        let ok = frame.write_to(&mut writer).await.is_ok();
        cq.post(tag, ok);
    }
}
