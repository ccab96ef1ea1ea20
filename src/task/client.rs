//! The concurrent test client. [`Client`] multiplexes any number of calls
//! over one TCP connection: the issuing task fires a whole batch back-to-back
//! without waiting for anything (fan-out), then drains its own completion
//! queue until every call is accounted for (fan-in). Replies arrive in
//! whatever order the server produces them; the tag on each completion event
//! resolves to the [`CallRecord`] that was allocated when the call was
//! submitted, which is all the bookkeeping there is.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use slab::Slab;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
};

use crate::{
    proto::{wire::Frame, HelloReply, HelloRequest, RpcStatus},
    sync::cq::{CompletionQueue, CqHandle, Event, Tag},
};

/// What the connection reader delivers into a call record.
type ReplyPayload = (RpcStatus, HelloReply);

/// Correlation state for a call that is on the wire: which tag to complete
/// and where to put the payload. Keyed by `call_id` in the pending map.
struct PendingReply {
    tag: Tag,
    cell: oneshot::Sender<ReplyPayload>,
}

/// Asynchronous greeter client. See [`Client::issue_and_await`].
pub struct Client {
    /// Frames waiting to be written by the connection writer task.
    requests: mpsc::UnboundedSender<Frame>,

    /// Calls that are on the wire, shared with the connection reader.
    pending: Arc<Mutex<HashMap<u64, PendingReply>>>,

    /// Completion queue this client drains. The connection reader owns its
    /// only producer handle, so a dead connection shuts the queue down.
    cq: CompletionQueue,

    /// `call_id` of the next submitted request. Monotonic, never reused
    /// within one connection.
    next_call_id: u64,

    /// Server address, for logs.
    target: SocketAddr,
}

impl Client {
    /// Connects to the greeter server at `target` and spawns the connection
    /// reader and writer tasks.
    pub async fn connect(target: SocketAddr) -> Result<Self, io::Error> {
        let stream = TcpStream::connect(target).await?;
        let (reader, writer) = stream.into_split();

        let (cq, cq_handle) = CompletionQueue::new();
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::task::spawn(write_requests(writer, requests_rx));
        tokio::task::spawn(read_replies(reader, Arc::clone(&pending), cq_handle, target));

        Ok(Self {
            requests,
            pending,
            cq,
            next_call_id: 0,
            target,
        })
    }

    /// Issues `count` concurrent calls, request `i` carrying the name
    /// `"{name_prefix}_{i}"`, then drains their completions and aggregates
    /// the results. If the completion queue shuts down before the batch is
    /// fully drained (the server died), the partial results are returned
    /// instead of blocking forever.
    pub async fn issue_and_await(&mut self, count: usize, name_prefix: &str) -> Summary {
        let completed = Arc::new(AtomicUsize::new(0));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let latency_us = Arc::new(AtomicU64::new(0));

        let mut records: Slab<CallRecord> = Slab::with_capacity(count);
        let started = Instant::now();

        println!("{} => Sending {count} concurrent requests", self.target);

        for i in 0..count {
            let call_id = self.next_call_id;
            self.next_call_id += 1;

            let (cell, reply) = oneshot::channel();

            let record = CallRecord {
                request_id: i,
                completed: Arc::clone(&completed),
                succeeded: Arc::clone(&succeeded),
                latency_us: Arc::clone(&latency_us),
                started_at: Instant::now(),
                reply,
            };

            let tag = Tag::from_key(records.insert(record));
            self.pending
                .lock()
                .unwrap()
                .insert(call_id, PendingReply { tag, cell });

            let frame = Frame::Request {
                call_id,
                request: HelloRequest {
                    name: format!("{name_prefix}_{i}"),
                },
            };

            // Failure means the connection is gone; the drain loop below will
            // observe the queue shutdown and report partial results.
            let _ = self.requests.send(frame);
        }

        println!(
            "{} => All {count} requests initiated, waiting for responses",
            self.target
        );

        let mut drained = 0;
        while drained < count {
            let Some(Event { tag, ok }) = self.cq.next().await else {
                eprintln!(
                    "{} => Completion queue shut down with {} calls outstanding",
                    self.target,
                    count - drained
                );
                break;
            };

            drained += 1;

            match records.try_remove(tag.key()) {
                Some(record) => record.finalize(ok),
                None => eprintln!("{} => Stray completion event for call {tag}", self.target),
            }
        }

        if !records.is_empty() {
            // Early shutdown. The connection is dead, so the correlation
            // state of the unfinished calls is dead weight.
            self.pending.lock().unwrap().clear();
        }

        Summary {
            total: count,
            completed: completed.load(Ordering::Relaxed),
            succeeded: succeeded.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
            cumulative_latency: Duration::from_micros(latency_us.load(Ordering::Relaxed)),
        }
    }
}

/// Bookkeeping for one outstanding call. Created immediately before the call
/// is submitted, destroyed when its completion event is drained, never
/// earlier and never later.
struct CallRecord {
    /// Position of the call within its batch.
    request_id: usize,

    /// Shared aggregate counters.
    completed: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
    latency_us: Arc<AtomicU64>,

    /// Taken right before the request frame was submitted.
    started_at: Instant,

    /// Filled by the connection reader before the completion event is posted.
    reply: oneshot::Receiver<ReplyPayload>,
}

impl CallRecord {
    /// Classifies the drained completion and folds it into the shared
    /// aggregates. The call succeeded only if the transport flag is set and
    /// the reported status is ok; everything else is recorded as a failure
    /// and never retried.
    fn finalize(mut self, ok: bool) {
        let elapsed = self.started_at.elapsed();
        self.completed.fetch_add(1, Ordering::Relaxed);

        let payload = self.reply.try_recv().ok();

        let success = matches!(&payload, Some((status, _)) if ok && status.is_ok());

        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            self.latency_us
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        } else {
            let detail = match &payload {
                Some((status, _)) if ok => format!("{} - {}", status.code, status.message),
                _ => String::from("operation not ok"),
            };

            println!(
                "Request {} failed: {detail} (took {}ms)",
                self.request_id,
                elapsed.as_millis()
            );
        }
    }
}

/// Aggregate result of one batch of concurrent calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Requests issued in the batch.
    pub total: usize,

    /// Completion events drained. Smaller than `total` only if the queue
    /// shut down mid-batch.
    pub completed: usize,

    /// Calls that succeeded at both the transport and application level.
    pub succeeded: usize,

    /// Wall time of the whole batch, fan-out included.
    pub elapsed: Duration,

    /// Sum of the per-call latencies of the successful calls.
    cumulative_latency: Duration,
}

impl Summary {
    /// Calls that completed but did not succeed.
    pub fn failed(&self) -> usize {
        self.completed - self.succeeded
    }

    /// Share of issued requests that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 * 100.0 / self.total as f64
        }
    }

    /// Mean latency of the successful calls. `None` when nothing succeeded,
    /// there is no meaningful average to report.
    pub fn mean_latency(&self) -> Option<Duration> {
        (self.succeeded > 0).then(|| self.cumulative_latency / self.succeeded as u32)
    }

    /// Successful calls per second of batch wall time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();

        if secs > 0.0 {
            self.succeeded as f64 / secs
        } else {
            0.0
        }
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Test Complete ===")?;
        writeln!(f, "Total time: {}ms", self.elapsed.as_millis())?;
        writeln!(f, "Total requests: {}", self.total)?;
        write!(f, "Success rate: {:.1}%", self.success_rate())?;

        if let Some(mean) = self.mean_latency() {
            write!(f, "\nAverage latency: {:.3}ms", mean.as_secs_f64() * 1000.0)?;
            write!(f, "\nRequests per second: {:.1}", self.throughput())?;
        }

        if self.succeeded < self.total {
            write!(f, "\nFailed requests: {}", self.total - self.succeeded)?;
        }

        Ok(())
    }
}

/// Connection writer: serializes request frames in submission order.
async fn write_requests(mut writer: OwnedWriteHalf, mut requests: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = requests.recv().await {
        // The reader will notice the dead connection, nothing to do here.
        if frame.write_to(&mut writer).await.is_err() {
            break;
        }
    }
}

/// Connection reader: correlates each reply back to its pending call through
/// the `call_id`, fills the record's payload cell and posts the completion
/// event. This task owns the queue's only producer handle, so when it exits
/// the drain loop observes shutdown instead of blocking forever.
async fn read_replies(
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<HashMap<u64, PendingReply>>>,
    cq: CqHandle,
    target: SocketAddr,
) {
    loop {
        match Frame::read_from(&mut reader).await {
            Ok(Some(Frame::Reply {
                call_id,
                status,
                reply,
            })) => {
                let Some(PendingReply { tag, cell }) = pending.lock().unwrap().remove(&call_id)
                else {
                    eprintln!("{target} => Reply for unknown call id {call_id}");
                    continue;
                };

                // Fill the record before posting, same ordering contract as
                // the server side dispatcher.
                let _ = cell.send((status, reply));
                cq.post(tag, true);
            }

            Ok(Some(Frame::Request { .. })) => {
                eprintln!("{target} => Server sent a request frame, closing");
                break;
            }

            // Server hung up cleanly.
            Ok(None) => break,

            Err(err) => {
                eprintln!("{target} => Connection error: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A [`CallRecord`] over fresh aggregate counters.
    fn stub_record(
        reply: oneshot::Receiver<ReplyPayload>,
    ) -> (CallRecord, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let completed = Arc::new(AtomicUsize::new(0));
        let succeeded = Arc::new(AtomicUsize::new(0));

        let record = CallRecord {
            request_id: 0,
            completed: Arc::clone(&completed),
            succeeded: Arc::clone(&succeeded),
            latency_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
            reply,
        };

        (record, completed, succeeded)
    }

    #[test]
    fn delivered_ok_reply_counts_as_success() {
        let (cell, reply) = oneshot::channel();
        let (record, completed, succeeded) = stub_record(reply);

        let _ = cell.send((
            RpcStatus::ok(),
            HelloReply {
                message: String::from("Hello stub"),
            },
        ));

        record.finalize(true);

        assert_eq!(completed.load(Ordering::Relaxed), 1);
        assert_eq!(succeeded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_operation_counts_as_completed_but_not_succeeded() {
        let (cell, reply) = oneshot::channel();
        let (record, completed, succeeded) = stub_record(reply);

        // Even a delivered ok payload can't rescue a failed operation.
        let _ = cell.send((
            RpcStatus::ok(),
            HelloReply {
                message: String::from("Hello stub"),
            },
        ));

        record.finalize(false);

        assert_eq!(completed.load(Ordering::Relaxed), 1);
        assert_eq!(succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn non_ok_status_counts_as_failure() {
        let (cell, reply) = oneshot::channel();
        let (record, completed, succeeded) = stub_record(reply);

        let _ = cell.send((
            RpcStatus {
                code: RpcStatus::RESOURCE_EXHAUSTED,
                message: String::from("reply exceeds the frame size limit"),
            },
            HelloReply {
                message: String::new(),
            },
        ));

        record.finalize(true);

        assert_eq!(completed.load(Ordering::Relaxed), 1);
        assert_eq!(succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn undelivered_payload_counts_as_failure() {
        let (cell, reply) = oneshot::channel::<ReplyPayload>();
        let (record, completed, succeeded) = stub_record(reply);

        drop(cell);
        record.finalize(true);

        assert_eq!(completed.load(Ordering::Relaxed), 1);
        assert_eq!(succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn empty_batch_summary_has_no_derived_values() {
        let summary = Summary {
            total: 0,
            completed: 0,
            succeeded: 0,
            elapsed: Duration::ZERO,
            cumulative_latency: Duration::ZERO,
        };

        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.success_rate(), 0.0);
        assert_eq!(summary.mean_latency(), None);
        assert_eq!(summary.throughput(), 0.0);

        // Rendering must not divide by anything it shouldn't.
        let rendered = summary.to_string();
        assert!(rendered.contains("Total requests: 0"));
        assert!(!rendered.contains("Average latency"));
    }

    #[test]
    fn summary_aggregate_arithmetic() {
        let summary = Summary {
            total: 4,
            completed: 4,
            succeeded: 2,
            elapsed: Duration::from_secs(2),
            cumulative_latency: Duration::from_millis(30),
        };

        assert_eq!(summary.failed(), 2);
        assert_eq!(summary.success_rate(), 50.0);
        assert_eq!(summary.mean_latency(), Some(Duration::from_millis(15)));
        assert_eq!(summary.throughput(), 1.0);

        let rendered = summary.to_string();
        assert!(rendered.contains("Failed requests: 2"));
        assert!(rendered.contains("Requests per second: 1.0"));
    }

    #[test]
    fn partial_batch_summary() {
        let summary = Summary {
            total: 50,
            completed: 10,
            succeeded: 10,
            elapsed: Duration::from_secs(1),
            cumulative_latency: Duration::from_millis(100),
        };

        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.success_rate(), 20.0);

        // The undrained calls show up against the issued total.
        assert!(summary.to_string().contains("Failed requests: 40"));
    }
}
