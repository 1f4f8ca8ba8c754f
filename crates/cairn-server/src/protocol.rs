//! Protocol wrappers and the listen rendezvous.
//!
//! Every inbound connection is represented by a [`ProtocolWrapper`] created
//! through [`ProtocolHub::wrap`].  Wrappers live in a weak registry under a
//! random, collision-free `u64` and leave it when the last handle drops.
//!
//! A wrapper that needs a [`DispatchContext`] calls
//! [`get_context`](ProtocolWrapper::get_context), which queues a request on
//! the hub's bounded wait queue and suspends.  The server's accept loop
//! ([`ProtocolHub::listen`]) pairs requests with contexts in FIFO order:
//!
//! ```text
//!  wrapper                     hub queue                   accept loop
//!  get_context ──enqueue──▶ [req, req, ...] ◀──dequeue── accept
//!       ▲                                                    │
//!       └────────────── Ok(DispatchContext) / Cancelled ─────┘
//! ```
//!
//! Requests flow from wrappers to the accept loop: wrappers queue and wait,
//! the loop drains.  An acceptor could equally park a placeholder for the
//! next wrapper to fill; either direction pairs each context with exactly
//! one waiter in arrival order and honours both tokens the same way.
//!
//! A context's token is linked to both the server's and the requester's
//! token.  A request whose token has fired is answered with `Cancelled`
//! and never receives a context.  The link is released when the last clone
//! of the context drops.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cairn_kernel::{CancellationToken, LinkedToken, WaitQueue, WeakRegistry, cancel};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{Result, ServerError};

// ---------------------------------------------------------------------------
// DispatchContext
// ---------------------------------------------------------------------------

/// One accepted unit of work, handed to exactly one wrapper.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    id: Uuid,
    wrapper_id: u64,
    cancel: LinkedToken,
}

impl DispatchContext {
    /// Time-ordered identifier of this context.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registry key of the wrapper the context was handed to.
    pub fn wrapper_id(&self) -> u64 {
        self.wrapper_id
    }

    /// Fires when either the server or the requester cancels.
    pub fn token(&self) -> &CancellationToken {
        self.cancel.token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A queued context request.
struct PendingContext {
    wrapper_id: u64,
    reply: oneshot::Sender<Result<DispatchContext>>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// ProtocolHub
// ---------------------------------------------------------------------------

/// Registry of live wrappers plus the rendezvous queue.
pub struct ProtocolHub {
    wrappers: WeakRegistry<ProtocolWrapper>,
    pending: WaitQueue<PendingContext>,
    dispatched: AtomicU64,
}

impl ProtocolHub {
    /// Create a hub whose queue holds at most `capacity` waiting requests.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            wrappers: WeakRegistry::new("protocol-wrappers"),
            pending: WaitQueue::new("protocol-contexts", capacity),
            dispatched: AtomicU64::new(0),
        })
    }

    /// Create a wrapper registered under a fresh unique id.
    pub fn wrap(self: &Arc<Self>) -> Result<Arc<ProtocolWrapper>> {
        let id = self.wrappers.reserve()?;
        let wrapper = Arc::new(ProtocolWrapper {
            id,
            hub: Arc::downgrade(self),
        });
        self.wrappers.bind(id, Arc::downgrade(&wrapper));
        trace!(wrapper = id, "protocol wrapper registered");
        Ok(wrapper)
    }

    /// Look up a live wrapper.
    pub fn wrapper(&self, id: u64) -> Option<Arc<ProtocolWrapper>> {
        self.wrappers.get(id)
    }

    /// Number of registered wrappers.
    pub fn live_wrappers(&self) -> usize {
        self.wrappers.len()
    }

    /// Number of requests waiting for the accept loop.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Total contexts handed out so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }

    /// Pair the oldest live request with a fresh context.
    ///
    /// Requests whose token already fired, or whose requester stopped
    /// waiting, are answered with `Cancelled` (when anyone is listening) and
    /// skipped.  Returns `Cancelled` once `server` fires.
    pub async fn accept(&self, server: &CancellationToken) -> Result<DispatchContext> {
        loop {
            let request = self.pending.dequeue(server).await?;
            let linked = cancel::link(server, &request.cancel);

            if linked.is_cancelled() || request.reply.is_closed() {
                linked.cancel();
                debug!(wrapper = request.wrapper_id, "skipping cancelled context request");
                let _ = request.reply.send(Err(ServerError::Cancelled));
                continue;
            }

            let context = DispatchContext {
                id: Uuid::now_v7(),
                wrapper_id: request.wrapper_id,
                cancel: linked,
            };
            match request.reply.send(Ok(context.clone())) {
                Ok(()) => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    debug!(wrapper = context.wrapper_id, context = %context.id, "context dispatched");
                    return Ok(context);
                }
                Err(_) => {
                    // The requester gave up between the check and the send.
                    context.cancel.cancel();
                    debug!(wrapper = context.wrapper_id, "requester left before dispatch");
                }
            }
        }
    }

    /// Accept requests until `token` fires, then answer every request still
    /// queued with `Cancelled`.
    pub async fn listen(&self, token: &CancellationToken) -> Result<()> {
        info!(capacity = self.capacity(), "protocol listener accepting");
        let outcome = loop {
            match self.accept(token).await {
                Ok(_) => {}
                Err(ServerError::Cancelled) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        let mut refused = 0usize;
        while let Some(request) = self.pending.try_dequeue() {
            let _ = request.reply.send(Err(ServerError::Cancelled));
            refused += 1;
        }
        info!(
            dispatched = self.dispatched(),
            refused, "protocol listener stopped"
        );
        outcome
    }
}

impl fmt::Debug for ProtocolHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHub")
            .field("wrappers", &self.live_wrappers())
            .field("pending", &self.pending())
            .field("dispatched", &self.dispatched())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProtocolWrapper
// ---------------------------------------------------------------------------

/// The protocol-facing handle of one inbound connection.
pub struct ProtocolWrapper {
    id: u64,
    hub: Weak<ProtocolHub>,
}

impl ProtocolWrapper {
    /// Registry key, unique among live wrappers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the accept loop to hand this wrapper a context.
    ///
    /// If `token` fires while the request is still queued, the request is
    /// withdrawn and `Cancelled` is returned.  If the accept loop already
    /// delivered a context, that context is returned; its token has fired
    /// as well.
    pub async fn get_context(&self, token: &CancellationToken) -> Result<DispatchContext> {
        let hub = self.hub.upgrade().ok_or(ServerError::HubClosed)?;
        let (reply, mut response) = oneshot::channel();
        let ticket = hub
            .pending
            .enqueue(
                PendingContext {
                    wrapper_id: self.id,
                    reply,
                    cancel: token.clone(),
                },
                token,
            )
            .await?;

        tokio::select! {
            biased;
            answer = &mut response => answer.unwrap_or(Err(ServerError::Cancelled)),
            _ = token.cancelled() => {
                if hub.pending.remove(ticket).is_some() {
                    debug!(wrapper = self.id, "context request withdrawn");
                    return Err(ServerError::Cancelled);
                }
                response.close();
                response.try_recv().unwrap_or(Err(ServerError::Cancelled))
            }
        }
    }
}

impl Drop for ProtocolWrapper {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.wrappers.unregister(self.id);
            trace!(wrapper = self.id, "protocol wrapper unregistered");
        }
    }
}

impl fmt::Debug for ProtocolWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolWrapper").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
