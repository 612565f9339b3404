//! Speech recognition permission.
//!
//! The gate asks the platform at most once per pending request: callers
//! arriving while a prompt is open join it, and once a terminal outcome is
//! known every later caller is answered from the cache without reaching the
//! platform again.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use tracing::{debug, info};

use crate::dispatch::{CloseMode, EventDispatcher};
use crate::error::{BridgeError, Result};
use crate::runtime::LoopHandle;
use crate::speech::NativeRecognizer;

/// Platform answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Granted,
    Denied,
    Restricted,
    Undetermined,
}

impl AuthorizationOutcome {
    /// Terminal outcomes are cached for the life of the bridge.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationOutcome::Undetermined)
    }

    /// Map the outcome onto the error `start` reports, if any.
    pub fn require_granted(self) -> Result<()> {
        match self {
            AuthorizationOutcome::Granted => Ok(()),
            AuthorizationOutcome::Denied => Err(BridgeError::AuthorizationDenied),
            AuthorizationOutcome::Restricted => Err(BridgeError::AuthorizationRestricted),
            AuthorizationOutcome::Undetermined => Err(BridgeError::AuthorizationRequired),
        }
    }
}

impl fmt::Display for AuthorizationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthorizationOutcome::Granted => "granted",
            AuthorizationOutcome::Denied => "denied",
            AuthorizationOutcome::Restricted => "restricted",
            AuthorizationOutcome::Undetermined => "undetermined",
        };
        f.write_str(name)
    }
}

/// Pending answer to [`request_authorization`].
///
/// Resolves on the runtime thread's next dispatch turn after the platform
/// answers, or to [`BridgeError::Disposed`] if the session is torn down first.
///
/// [`request_authorization`]: crate::RecognizerSession::request_authorization
#[must_use = "the outcome is only observable through the request"]
pub struct AuthorizationRequest {
    rx: oneshot::Receiver<AuthorizationOutcome>,
}

impl AuthorizationRequest {
    fn resolved(outcome: AuthorizationOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Non-blocking check. `Ok(None)` while the platform has not answered.
    pub fn try_outcome(&mut self) -> Result<Option<AuthorizationOutcome>> {
        self.rx.try_recv().map_err(|_| BridgeError::Disposed)
    }
}

impl Future for AuthorizationRequest {
    type Output = Result<AuthorizationOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| BridgeError::Disposed))
    }
}

pub(crate) struct AuthorizationGate {
    cached: Option<AuthorizationOutcome>,
    in_flight: Option<EventDispatcher<AuthorizationOutcome>>,
    waiters: Vec<oneshot::Sender<AuthorizationOutcome>>,
    runtime: LoopHandle,
}

impl AuthorizationGate {
    pub fn new(runtime: LoopHandle, initial: AuthorizationOutcome) -> Self {
        Self {
            cached: Some(initial),
            in_flight: None,
            waiters: Vec::new(),
            runtime,
        }
    }

    pub fn outcome(&self) -> Option<AuthorizationOutcome> {
        self.cached
    }

    pub fn request(&mut self, native: &mut dyn NativeRecognizer) -> Result<AuthorizationRequest> {
        if let Some(outcome) = self.cached.filter(|o| o.is_terminal()) {
            debug!(%outcome, "authorization answered from cache");
            return Ok(AuthorizationRequest::resolved(outcome));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);

        if self.in_flight.is_none() {
            // Dedicated single-shot channel for this prompt.
            let (dispatcher, publisher) =
                EventDispatcher::new("authorization", 1, &self.runtime)?;
            self.in_flight = Some(dispatcher);
            info!("requesting speech recognition authorization");
            native.request_authorization(Box::new(move |outcome| {
                publisher.publish(outcome);
            }));
        } else {
            debug!(waiters = self.waiters.len(), "joined pending authorization request");
        }

        Ok(AuthorizationRequest { rx })
    }

    /// Runtime turn: record the platform's answer and resolve every waiter.
    pub fn pump(&mut self) -> Result<Option<AuthorizationOutcome>> {
        let Some(dispatcher) = self.in_flight.as_mut() else {
            return Ok(None);
        };

        let mut answer = None;
        dispatcher.deliver_with(|outcome| answer = Some(outcome))?;
        let Some(outcome) = answer else {
            return Ok(None);
        };

        if let Some(mut dispatcher) = self.in_flight.take() {
            dispatcher.close(CloseMode::Discard);
        }
        info!(%outcome, "speech recognition authorization resolved");
        self.cached = Some(outcome);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome);
        }
        Ok(Some(outcome))
    }

    /// Drop pending waiters; they observe `Disposed`.
    pub fn close(&mut self) {
        if let Some(mut dispatcher) = self.in_flight.take() {
            dispatcher.close(CloseMode::Discard);
        }
        if !self.waiters.is_empty() {
            debug!(waiters = self.waiters.len(), "abandoning authorization waiters");
        }
        self.waiters.clear();
    }
}
