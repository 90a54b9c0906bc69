//! Actor-owned priority queues for in-flight requests.
//!
//! A [`Queue`] is a min-heap of requests keyed by `(priority,
//! insertion-order)`, owned exclusively by a dispatcher task. Mutations
//! (enqueue, set priority, remove, finalize) travel to the dispatcher as
//! commands over a channel and are acknowledged individually; consumers pop
//! or drain through oneshot tickets the dispatcher only serves while the
//! heap is non-empty. This gives exclusive ownership of the heap without
//! external locks.
//!
//! Two instances back the pipeline: the resolver queue holds unresolved
//! requests awaiting provider dispatch, the resolved queue holds resolved
//! requests awaiting retrieval. Resolved requests are stamped with a
//! strictly monotonic pop order (`SeqNum`) as they leave.
//!
//! # Termination
//!
//! [`Queue::finalize`] marks the queue; the dispatcher exits — waking all
//! pending consumers with `None` — once the heap is empty *and* no producer
//! holds a [`QueueLease`]. A served drain implicitly leases the queue until
//! the consumer finishes re-enqueueing from that batch, so a finalized
//! queue cannot close under a resolver that still owes it children.
//! [`Queue::stop`] closes immediately, leases notwithstanding.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::request::Request;

type PopTicket = oneshot::Sender<Arc<Request>>;
type DrainTicket = oneshot::Sender<Vec<Arc<Request>>>;

enum Command {
    Enqueue {
        request: Arc<Request>,
        done: oneshot::Sender<()>,
    },
    EnqueueAll {
        requests: Vec<Arc<Request>>,
        done: oneshot::Sender<()>,
    },
    SetPriority {
        id: String,
        priority: i32,
        done: oneshot::Sender<()>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Option<Arc<Request>>>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<Request>>>,
    },
    Finalize {
        done: oneshot::Sender<()>,
    },
    Lease,
    Release,
    Stop,
}

/// A thread-safe priority queue of requests.
///
/// All methods are safe to call from any task. Once the queue has closed
/// (finalized and drained, or stopped), mutations become no-ops and
/// [`Queue::dequeue`] / [`Queue::list`] return `None` / empty.
pub struct Queue {
    commands: mpsc::UnboundedSender<Command>,
    pops: mpsc::UnboundedSender<PopTicket>,
    drains: mpsc::UnboundedSender<DrainTicket>,
}

impl Queue {
    /// Creates a queue and spawns its dispatcher task.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (pops, pop_rx) = mpsc::unbounded_channel();
        let (drains, drain_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(name, command_rx, pop_rx, drain_rx));
        Arc::new(Self {
            commands,
            pops,
            drains,
        })
    }

    /// Enqueues a single request, waiting for the mutation to land.
    pub(crate) async fn enqueue(&self, request: Arc<Request>) {
        let (done, ack) = oneshot::channel();
        if self
            .commands
            .send(Command::Enqueue { request, done })
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Enqueues a batch of requests as one mutation.
    pub(crate) async fn enqueue_all(&self, requests: Vec<Arc<Request>>) {
        let (done, ack) = oneshot::channel();
        if self
            .commands
            .send(Command::EnqueueAll { requests, done })
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Changes the priority of the queued request with the given ID.
    /// A no-op when no queued request matches.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_priority(&self, id: &str, priority: i32) {
        let (done, ack) = oneshot::channel();
        let command = Command::SetPriority {
            id: id.to_string(),
            priority,
            done,
        };
        if self.commands.send(command).is_ok() {
            let _ = ack.await;
        }
    }

    /// Unlinks and returns the queued request with the given ID.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, id: &str) -> Option<Arc<Request>> {
        let (reply, response) = oneshot::channel();
        let command = Command::Remove {
            id: id.to_string(),
            reply,
        };
        self.commands.send(command).ok()?;
        response.await.ok().flatten()
    }

    /// Returns a snapshot of the queued requests in pop order, without
    /// consuming them.
    pub async fn list(&self) -> Vec<Arc<Request>> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::List { reply }).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Pops the request with the lowest `(priority, insertion-order)` key,
    /// waiting for one to arrive if the queue is empty.
    ///
    /// Returns `None` once the queue has closed.
    pub async fn dequeue(&self) -> Option<Arc<Request>> {
        let (ticket, delivery) = oneshot::channel();
        self.pops.send(ticket).ok()?;
        delivery.await.ok()
    }

    /// Takes the entire backlog in pop order, waiting for at least one
    /// request if the queue is empty. The returned [`QueueLease`] keeps a
    /// finalized queue open until the batch has been fully processed; drop
    /// it once any re-enqueues from the batch have landed.
    ///
    /// Returns `None` once the queue has closed.
    pub(crate) async fn drain_all(&self) -> Option<(Vec<Arc<Request>>, QueueLease)> {
        let (ticket, delivery) = oneshot::channel();
        self.drains.send(ticket).ok()?;
        let batch = delivery.await.ok()?;
        Some((
            batch,
            QueueLease {
                commands: self.commands.clone(),
            },
        ))
    }

    /// Takes a producer lease on this queue, deferring close-on-finalize
    /// until the lease is dropped.
    pub(crate) fn lease(&self) -> QueueLease {
        let _ = self.commands.send(Command::Lease);
        QueueLease {
            commands: self.commands.clone(),
        }
    }

    /// Marks the queue finalized: once drained and lease-free it closes,
    /// waking all pending consumers.
    pub(crate) async fn finalize(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Finalize { done }).is_ok() {
            let _ = ack.await;
        }
    }

    /// Closes the queue immediately. Pending consumers observe `None`;
    /// queued requests are dropped.
    pub(crate) fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Keeps a finalized [`Queue`] from closing while a producer may still
/// enqueue. Released on drop.
pub struct QueueLease {
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release);
    }
}

struct Entry {
    priority: i32,
    order: u64,
    request: Arc<Request>,
}

impl Entry {
    fn key(&self) -> (i32, u64) {
        (self.priority, self.order)
    }
}

// Inverted ordering: `BinaryHeap` is a max-heap, the queue serves the
// lowest key first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

struct Dispatcher {
    name: &'static str,
    heap: BinaryHeap<Entry>,
    next_order: u64,
    pop_count: i64,
    finalized: bool,
    leases: usize,
}

impl Dispatcher {
    fn closed(&self) -> bool {
        self.heap.is_empty() && self.finalized && self.leases == 0
    }

    /// Applies a mutation. Returns `false` when the command was `Stop`.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue { request, done } => {
                self.push(request);
                let _ = done.send(());
            }
            Command::EnqueueAll { requests, done } => {
                for request in requests {
                    self.push(request);
                }
                let _ = done.send(());
            }
            Command::SetPriority { id, priority, done } => {
                self.reprioritize(&id, priority);
                let _ = done.send(());
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id));
            }
            Command::List { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Finalize { done } => {
                debug!(queue = self.name, "queue finalized");
                self.finalized = true;
                let _ = done.send(());
            }
            Command::Lease => self.leases += 1,
            Command::Release => self.leases = self.leases.saturating_sub(1),
            Command::Stop => return false,
        }
        true
    }

    fn push(&mut self, request: Arc<Request>) {
        let entry = Entry {
            priority: request.priority(),
            order: self.next_order,
            request,
        };
        self.next_order += 1;
        self.heap.push(entry);
    }

    fn reprioritize(&mut self, id: &str, priority: i32) {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let mut matched = false;
        for entry in &mut entries {
            if !matched && entry.request.id() == id {
                entry.priority = priority;
                entry.request.set_priority(priority);
                matched = true;
            }
        }
        if !matched {
            warn!(
                queue = self.name,
                id, "set_priority: no queued request matches"
            );
        }
        self.heap = BinaryHeap::from(entries);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Request>> {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let position = entries.iter().position(|entry| entry.request.id() == id);
        let removed = position.map(|index| entries.swap_remove(index).request);
        self.heap = BinaryHeap::from(entries);
        removed
    }

    fn snapshot(&self) -> Vec<Arc<Request>> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by_key(|entry| entry.key());
        entries
            .into_iter()
            .map(|entry| Arc::clone(&entry.request))
            .collect()
    }

    /// Serves a pop ticket with the heap minimum. Only called while the
    /// heap is non-empty.
    fn pop_into(&mut self, ticket: PopTicket) {
        let Some(entry) = self.heap.pop() else {
            return;
        };
        let Entry {
            priority,
            order,
            request,
        } = entry;
        if let Some(file) = request.file() {
            file.set_pop_order(self.pop_count);
        }
        self.pop_count += 1;
        if let Err(request) = ticket.send(request) {
            // Consumer vanished before delivery: keep the entry and the
            // pop counter consistent so SeqNum stays gapless.
            self.pop_count -= 1;
            self.heap.push(Entry {
                priority,
                order,
                request,
            });
        }
    }

    /// Hands the entire backlog to a drain ticket and leases the queue to
    /// the consumer. Only called while the heap is non-empty.
    fn drain_into(&mut self, ticket: DrainTicket) {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        entries.sort_by_key(Entry::key);
        let batch: Vec<Arc<Request>> = entries.into_iter().map(|entry| entry.request).collect();
        self.leases += 1;
        if let Err(batch) = ticket.send(batch) {
            self.leases -= 1;
            for request in batch {
                self.push(request);
            }
        }
    }
}

async fn dispatch(
    name: &'static str,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut pops: mpsc::UnboundedReceiver<PopTicket>,
    mut drains: mpsc::UnboundedReceiver<DrainTicket>,
) {
    let mut state = Dispatcher {
        name,
        heap: BinaryHeap::new(),
        next_order: 0,
        pop_count: 0,
        finalized: false,
        leases: 0,
    };

    loop {
        if state.heap.is_empty() {
            if state.closed() {
                break;
            }
            // Only mutations can make progress on an empty heap; consumers
            // wait in their ticket channels.
            match commands.recv().await {
                Some(command) => {
                    if !state.apply(command) {
                        break;
                    }
                }
                None => break,
            }
        } else {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !state.apply(command) {
                            break;
                        }
                    }
                    None => break,
                },
                ticket = pops.recv() => match ticket {
                    Some(ticket) => state.pop_into(ticket),
                    None => break,
                },
                ticket = drains.recv() => match ticket {
                    Some(ticket) => state.drain_into(ticket),
                    None => break,
                },
            }
        }
    }

    debug!(queue = name, "queue dispatcher exiting");
    // Dropping the ticket receivers wakes every pending consumer with a
    // closed channel, observed as `None`.
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use url::Url;

    use super::*;
    use crate::file::{File, FileMeta};
    use crate::request::BatchSignal;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn request(s: &str) -> Arc<Request> {
        Request::new_root(url(s), Arc::new(BatchSignal::new(1)))
    }

    fn resolved_request(s: &str) -> Arc<Request> {
        let request = request(s);
        let meta = FileMeta {
            name: "x".to_string(),
            size: Some(1),
            url: url(s),
            checksum: None,
        };
        request.bind_file(File::online(meta, "direct", url(s), Box::new(|| {})));
        request
    }

    async fn dequeue(queue: &Queue) -> Option<Arc<Request>> {
        timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .expect("dequeue timed out")
    }

    #[tokio::test]
    async fn test_pop_follows_priority_order() {
        let queue = Queue::new("test");
        let low = request("https://host/low");
        low.set_priority(5);
        let high = request("https://host/high");
        high.set_priority(-5);
        queue.enqueue(low).await;
        queue.enqueue(high).await;

        let first = dequeue(&queue).await.unwrap();
        assert_eq!(first.current_url().as_str(), "https://host/high");
        let second = dequeue(&queue).await.unwrap();
        assert_eq!(second.current_url().as_str(), "https://host/low");
    }

    #[tokio::test]
    async fn test_equal_priority_pops_in_insertion_order() {
        let queue = Queue::new("test");
        for index in 0..4 {
            queue
                .enqueue(request(&format!("https://host/{index}")))
                .await;
        }
        for index in 0..4 {
            let next = dequeue(&queue).await.unwrap();
            assert_eq!(next.current_url().as_str(), format!("https://host/{index}"));
        }
    }

    #[tokio::test]
    async fn test_pop_stamps_gapless_seq_nums() {
        let queue = Queue::new("test");
        let requests: Vec<_> = (0..3)
            .map(|index| resolved_request(&format!("https://host/{index}")))
            .collect();
        queue.enqueue_all(requests).await;

        for expected in 0..3 {
            let next = dequeue(&queue).await.unwrap();
            assert_eq!(next.file().unwrap().seq_num(), expected);
        }
    }

    #[tokio::test]
    async fn test_set_priority_reorders_pending_requests() {
        let queue = Queue::new("test");
        let first = request("https://host/first");
        let second = request("https://host/second");
        let id = second.id();
        queue.enqueue(first).await;
        queue.enqueue(second).await;
        queue.set_priority(&id, -1).await;

        let popped = dequeue(&queue).await.unwrap();
        assert_eq!(popped.current_url().as_str(), "https://host/second");
        assert_eq!(popped.priority(), -1);
    }

    #[tokio::test]
    async fn test_remove_unlinks_by_id() {
        let queue = Queue::new("test");
        let keep = request("https://host/keep");
        let drop_me = request("https://host/drop");
        let id = drop_me.id();
        queue.enqueue_all(vec![keep, drop_me]).await;

        let removed = queue.remove(&id).await.unwrap();
        assert_eq!(removed.current_url().as_str(), "https://host/drop");
        assert!(queue.remove(&id).await.is_none());
        assert_eq!(queue.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_snapshots_in_pop_order() {
        let queue = Queue::new("test");
        let urgent = request("https://host/urgent");
        urgent.set_priority(-1);
        queue.enqueue(request("https://host/a")).await;
        queue.enqueue(urgent).await;

        let listed = queue.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].current_url().as_str(), "https://host/urgent");
        // Listing does not consume.
        assert_eq!(queue.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_closes_after_drain() {
        let queue = Queue::new("test");
        queue.enqueue(request("https://host/a")).await;
        queue.finalize().await;

        assert!(dequeue(&queue).await.is_some());
        assert!(dequeue(&queue).await.is_none());
        // Closed queues keep answering `None`.
        assert!(dequeue(&queue).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_immediately() {
        let queue = Queue::new("test");
        queue.enqueue(request("https://host/a")).await;
        queue.stop();
        // Give the dispatcher a beat to observe the stop command.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dequeue(&queue).await.is_none());
    }

    #[tokio::test]
    async fn test_drain_takes_whole_backlog_sorted() {
        let queue = Queue::new("test");
        let urgent = request("https://host/urgent");
        urgent.set_priority(-2);
        queue.enqueue(request("https://host/a")).await;
        queue.enqueue(request("https://host/b")).await;
        queue.enqueue(urgent).await;

        let (batch, lease) = queue.drain_all().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].current_url().as_str(), "https://host/urgent");
        assert_eq!(batch[1].current_url().as_str(), "https://host/a");
        assert!(queue.list().await.is_empty());
        drop(lease);
    }

    #[tokio::test]
    async fn test_drain_lease_defers_finalize_close() {
        let queue = Queue::new("test");
        queue.enqueue(request("https://host/container")).await;

        let (batch, lease) = queue.drain_all().await.unwrap();
        assert_eq!(batch.len(), 1);
        queue.finalize().await;

        // The heap is empty and the queue finalized, but the lease keeps
        // it open for re-enqueues from the drained batch.
        queue.enqueue(request("https://host/child")).await;
        drop(lease);

        assert!(dequeue(&queue).await.is_some());
        assert!(dequeue(&queue).await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_late_enqueue() {
        let queue = Queue::new("test");
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(request("https://host/late")).await;

        let popped = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped.current_url().as_str(), "https://host/late");
    }

    #[tokio::test]
    async fn test_insertion_order_is_monotonic_across_reenqueues() {
        let queue = Queue::new("test");
        let first = request("https://host/first");
        queue.enqueue(Arc::clone(&first)).await;
        let popped = dequeue(&queue).await.unwrap();
        assert!(Arc::ptr_eq(&popped, &first));

        // Re-enqueue after another request: the re-enqueued request gets a
        // fresh insertion order and pops second.
        queue.enqueue(request("https://host/second")).await;
        queue.enqueue(first).await;
        assert_eq!(
            dequeue(&queue).await.unwrap().current_url().as_str(),
            "https://host/second"
        );
        assert_eq!(
            dequeue(&queue).await.unwrap().current_url().as_str(),
            "https://host/first"
        );
    }
}
