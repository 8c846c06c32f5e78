//! Call state machine
//!
//! [`CallMachine`] tracks the single current call: placing outbound calls,
//! offering inbound ones, applying call-level SDK events, and finalizing the
//! call-log record exactly once when the call ends.
//!
//! # States
//!
//! ```text
//!            make_call                 ringing            accept
//!   idle ─────────────► connecting ─────────────► ringing ───────► active ◄──► held
//!    ▲ ▲                    │                        │               │          │
//!    │ │                    └──────── error / reject ┴───────────────┴──► failed│
//!    │ │                                                             │          │
//!    │ │ incoming   accept                       disconnect / hangup └─► completed
//!    │ └─────── incoming ─────► active
//!    │            │
//!    └────────────┘ reject / cancel
//! ```
//!
//! `completed` and `failed` are displayed briefly, then reset to `idle`.
//! A new call may start from either of them.
//!
//! # Call identity
//!
//! An event applies to the tracked call when the tracked call has no id yet
//! (the event's id is adopted), when the event carries no id, or when the ids
//! match. Anything else is stale and ignored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::call::{normalize_address, CallDirection, CallId, CallInfo, CallState, CallStatus};
use crate::call_log::{CallLogBridge, CallLogStatus, LogId};
use crate::client::state::Diagnostics;
use crate::client::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{CallStatusInfo, ClientEvent, EventPriority, IncomingCallInfo};
use crate::normalize::{CallEvent, CallEventKind};
use crate::sdk::{CallLeg, ConnectParams, VoiceDevice};

/// Link between a tracked call and its call-log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogLink {
    /// No record requested, or the store was unavailable
    Detached,
    /// Record creation is in flight
    Pending,
    Open(LogId),
}

/// Outcome of a call that ended before its record was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EndedCall {
    pub status: CallLogStatus,
    pub duration_secs: u64,
    pub note: Option<String>,
}

pub(crate) struct TrackedCall {
    pub leg: Option<Arc<dyn CallLeg>>,
    pub call_id: Option<CallId>,
    pub direction: CallDirection,
    pub counterpart: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub log: LogLink,
}

impl TrackedCall {
    fn new(direction: CallDirection, counterpart: String) -> Self {
        Self {
            leg: None,
            call_id: None,
            direction,
            counterpart,
            created_at: Utc::now(),
            started_at: None,
            log: LogLink::Detached,
        }
    }

    fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            direction: self.direction,
            counterpart: self.counterpart.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }

    /// Check (and adopt) an event's call id
    fn claims(&mut self, event_id: Option<&CallId>) -> bool {
        if self.call_id.is_none() {
            self.call_id = self.leg.as_ref().and_then(|leg| leg.id());
        }
        match (&self.call_id, event_id) {
            (None, Some(id)) => {
                self.call_id = Some(id.clone());
                true
            }
            (_, None) => true,
            (Some(tracked), Some(id)) => tracked == id,
        }
    }
}

pub(crate) struct CallSlot {
    pub state: CallState,
    pub call: Option<TrackedCall>,
    pub muted: bool,
    pub on_hold: bool,
    pub note: Option<String>,
    /// Incremented for every new call; async work re-checks it before writing
    pub epoch: u64,
    /// Last finished call, shown while the terminal state is displayed
    pub last_call: Option<CallInfo>,
    /// Ended calls, by epoch, whose log record is still being created
    pub unlogged: HashMap<u64, EndedCall>,
}

impl CallSlot {
    /// The tracked call, if it is still the one started at `epoch`
    pub fn tracked_mut(&mut self, epoch: u64) -> Option<&mut TrackedCall> {
        if self.epoch != epoch {
            return None;
        }
        self.call.as_mut()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.call.is_some()
    }

    fn status(&self) -> CallStatus {
        let call = match &self.call {
            Some(call) => Some(call.info()),
            None if self.state.is_terminal() => self.last_call.clone(),
            None => None,
        };
        let incoming_number = match (&self.call, self.state) {
            (Some(call), CallState::Incoming) => Some(call.counterpart.clone()),
            _ => None,
        };
        CallStatus {
            state: self.state,
            is_muted: self.muted,
            is_on_hold: self.on_hold,
            incoming_number,
            call,
        }
    }
}

/// What a call event resolved to once the slot lock is released
enum Followup {
    None,
    Finish(CallState, String),
    Missed(String),
    FailPending(String),
}

/// State machine for the single current call
pub struct CallMachine {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) call_log: Arc<CallLogBridge>,
    status_tx: watch::Sender<CallStatus>,
    pub(crate) inner: Mutex<CallSlot>,
}

impl CallMachine {
    pub(crate) fn new(config: Arc<ClientConfig>, diagnostics: Arc<Diagnostics>, call_log: Arc<CallLogBridge>) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::default());
        Self {
            config,
            diagnostics,
            call_log,
            status_tx,
            inner: Mutex::new(CallSlot {
                state: CallState::Idle,
                call: None,
                muted: false,
                on_hold: false,
                note: None,
                epoch: 0,
                last_call: None,
                unlogged: HashMap::new(),
            }),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.inner.lock().status()
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn watch(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    /// Place an outbound call through `device`.
    ///
    /// Rejected with [`ClientError::CallInProgress`] while another call is
    /// live. The call-log record is created alongside the dial; a slow or
    /// unavailable store never delays it. A connect failure ends the call as
    /// failed and is returned.
    pub async fn make_call(self: &Arc<Self>, device: Arc<dyn VoiceDevice>, to: &str) -> ClientResult<()> {
        let address = normalize_address(to).ok_or_else(|| ClientError::InvalidAddress {
            address: to.to_string(),
        })?;

        let epoch = {
            let mut slot = self.inner.lock();
            if !slot.state.is_idle() {
                return Err(ClientError::CallInProgress { state: slot.state });
            }
            slot.epoch += 1;
            let mut call = TrackedCall::new(CallDirection::Outbound, address.clone());
            call.log = LogLink::Pending;
            slot.call = Some(call);
            slot.note = None;
            slot.muted = false;
            slot.on_hold = false;
            slot.last_call = None;
            self.transition(&mut slot, CallState::Connecting, Some("Dialing".to_string()));
            slot.epoch
        };
        info!(to = %address, epoch, "Placing call");
        self.diagnostics.note(format!("Calling {}", address));
        self.open_log(epoch, CallDirection::Outbound, address.clone());

        match device.connect(ConnectParams::new(address.clone())).await {
            Ok(leg) => {
                let attached = {
                    let mut slot = self.inner.lock();
                    let attached = match slot.tracked_mut(epoch) {
                        Some(call) => {
                            if call.call_id.is_none() {
                                call.call_id = leg.id();
                            }
                            call.leg = Some(leg.clone());
                            true
                        }
                        None => false,
                    };
                    if attached {
                        self.publish(&slot);
                    }
                    attached
                };
                if !attached {
                    debug!(epoch, "Call ended while connecting, dropping leg");
                    if let Err(e) = leg.disconnect().await {
                        debug!(error = %e, "Disconnect of abandoned leg failed");
                    }
                    return Err(ClientError::cancelled("call ended before connecting"));
                }
                Ok(())
            }
            Err(e) => {
                let err = ClientError::transport(format!("Failed to place call to {}: {}", address, e));
                self.finish(epoch, CallState::Failed, err.to_string());
                Err(err)
            }
        }
    }

    /// Accept the pending incoming call
    pub async fn accept(self: &Arc<Self>) -> ClientResult<()> {
        let (leg, epoch, from) = self.pending_incoming()?;

        if let Err(e) = leg.accept().await {
            let err = ClientError::transport(format!("Failed to accept call from {}: {}", from, e));
            self.finish(epoch, CallState::Failed, err.to_string());
            return Err(err);
        }

        {
            let mut slot = self.inner.lock();
            match slot.tracked_mut(epoch) {
                Some(call) => {
                    call.started_at = Some(Utc::now());
                    call.log = LogLink::Pending;
                }
                None => return Err(ClientError::cancelled("call ended before it was answered")),
            }
            self.transition(&mut slot, CallState::Active, Some("Answered".to_string()));
        }
        info!(from = %from, "Incoming call accepted");
        self.diagnostics.note(format!("Answered call from {}", from));
        self.open_log(epoch, CallDirection::Inbound, from);
        Ok(())
    }

    /// Create the call-log record for the call started at `epoch` in the
    /// background.
    ///
    /// If the call is still tracked once the record exists, the id is
    /// attached and [`finish`](Self::finish) finalizes it later. If the call
    /// ended in the meantime, the outcome `finish` left in the slot is
    /// written instead.
    fn open_log(self: &Arc<Self>, epoch: u64, direction: CallDirection, counterpart: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let log_id = this.call_log.start(direction, &counterpart).await;
            let ended = {
                let mut slot = this.inner.lock();
                if let Some(call) = slot.tracked_mut(epoch) {
                    call.log = match log_id {
                        Some(id) => LogLink::Open(id),
                        None => LogLink::Detached,
                    };
                    return;
                }
                slot.unlogged.remove(&epoch)
            };

            let Some(log_id) = log_id else {
                return;
            };
            let ended = ended.unwrap_or_else(|| {
                warn!(log_id = %log_id, epoch, "No outcome recorded for ended call");
                EndedCall {
                    status: CallLogStatus::Completed,
                    duration_secs: 0,
                    note: None,
                }
            });
            debug!(log_id = %log_id, epoch, status = ?ended.status, "Finalizing record of an ended call");
            this.call_log
                .finalize(&log_id, ended.status, ended.duration_secs, ended.note)
                .await;
        });
    }

    /// Decline the pending incoming call. No call-log record is written.
    pub async fn reject(self: &Arc<Self>, reason: Option<&str>) -> ClientResult<()> {
        let (leg, epoch, from) = self.pending_incoming()?;
        let reason = reason.unwrap_or("Declined").to_string();

        if let Err(e) = leg.reject().await {
            warn!(from = %from, error = %e, "SDK reject failed");
            self.diagnostics.note(format!("Reject failed: {}", e));
        }

        {
            let mut slot = self.inner.lock();
            if slot.is_current(epoch) {
                slot.call = None;
                self.transition(&mut slot, CallState::Idle, Some(reason.clone()));
            }
        }
        self.diagnostics.note(format!("Rejected call from {} ({})", from, reason));
        Ok(())
    }

    /// End the current call, whatever stage it is in
    pub async fn hang_up(self: &Arc<Self>) -> ClientResult<()> {
        let (state, leg, epoch) = {
            let slot = self.inner.lock();
            let leg = slot.call.as_ref().and_then(|c| c.leg.clone());
            (slot.state, leg, slot.epoch)
        };

        match state {
            CallState::Incoming => self.reject(Some("Hung up")).await,
            state if state.is_live() => {
                if let Some(leg) = leg {
                    if let Err(e) = leg.disconnect().await {
                        warn!(error = %e, "SDK disconnect failed");
                        self.diagnostics.note(format!("Disconnect failed: {}", e));
                    }
                }
                self.finish(epoch, CallState::Completed, "Hung up".to_string());
                Ok(())
            }
            state => {
                debug!(state = %state, "Nothing to hang up");
                Ok(())
            }
        }
    }

    /// End the current call because its device went away
    pub fn abandon(self: &Arc<Self>, reason: &str) {
        let (state, epoch) = {
            let slot = self.inner.lock();
            (slot.state, slot.epoch)
        };
        match state {
            CallState::Incoming => {
                let mut slot = self.inner.lock();
                if slot.is_current(epoch) {
                    slot.call = None;
                    self.transition(&mut slot, CallState::Idle, Some(reason.to_string()));
                }
            }
            state if state.is_live() => {
                self.finish(epoch, CallState::Failed, format!("Call dropped: {}", reason));
            }
            _ => {}
        }
    }

    /// Apply a normalized call-level event. Never waits on the call-log store.
    pub fn handle_event(self: &Arc<Self>, event: CallEvent) {
        let CallEvent { call_id, kind } = event;
        let kind = match kind {
            CallEventKind::Incoming { leg, from } => {
                self.offer_incoming(call_id, leg, from);
                return;
            }
            kind => kind,
        };

        let (epoch, followup) = {
            let mut slot = self.inner.lock();
            let epoch = slot.epoch;
            let state = slot.state;
            let Some(call) = slot.call.as_mut() else {
                debug!(?kind, call_id = ?call_id, "Call event with no tracked call");
                return;
            };
            if !call.claims(call_id.as_ref()) {
                debug!(?kind, call_id = ?call_id, tracked = ?call.call_id, "Ignoring event for stale call");
                return;
            }
            let counterpart = call.counterpart.clone();

            let followup = match (kind, state) {
                (CallEventKind::Ringing, CallState::Connecting) => {
                    self.transition(&mut slot, CallState::Ringing, Some("Ringing".to_string()));
                    Followup::None
                }
                (CallEventKind::Accepted, CallState::Connecting | CallState::Ringing) => {
                    if let Some(call) = slot.call.as_mut() {
                        call.started_at = Some(Utc::now());
                    }
                    self.transition(&mut slot, CallState::Active, Some("Connected".to_string()));
                    Followup::None
                }
                (CallEventKind::Disconnected | CallEventKind::Cancelled, CallState::Incoming) => {
                    Followup::Missed(counterpart)
                }
                (CallEventKind::Disconnected, state) if state.is_live() => {
                    Followup::Finish(CallState::Completed, "Remote party hung up".to_string())
                }
                (CallEventKind::Cancelled, state) if state.is_live() => {
                    Followup::Finish(CallState::Completed, "Call cancelled".to_string())
                }
                (CallEventKind::Rejected, state) if state.is_live() => {
                    Followup::Finish(CallState::Failed, format!("Call rejected by {}", counterpart))
                }
                (CallEventKind::Error { message }, CallState::Incoming) => Followup::FailPending(message),
                (CallEventKind::Error { message }, state) if state.is_live() => {
                    Followup::Finish(CallState::Failed, format!("Call error: {}", message))
                }
                (kind, state) => {
                    debug!(?kind, state = %state, "Call event does not apply in current state");
                    Followup::None
                }
            };
            (epoch, followup)
        };

        match followup {
            Followup::None => {}
            Followup::Finish(outcome, reason) => self.finish(epoch, outcome, reason),
            Followup::Missed(from) => {
                if self.clear_pending(epoch, "Caller hung up") {
                    self.diagnostics.note(format!("Missed call from {}", from));
                }
            }
            Followup::FailPending(message) => {
                if self.clear_pending(epoch, &message) {
                    self.diagnostics.fail(format!("Incoming call error: {}", message));
                }
            }
        }
    }

    fn offer_incoming(&self, call_id: Option<CallId>, leg: Arc<dyn CallLeg>, from: String) {
        let info = {
            let mut slot = self.inner.lock();
            if !slot.state.is_idle() {
                drop(slot);
                info!(from = %from, "Incoming call while busy, ignoring");
                self.diagnostics
                    .note(format!("Ignored incoming call from {}: another call is in progress", from));
                return;
            }
            slot.epoch += 1;
            let mut call = TrackedCall::new(CallDirection::Inbound, from.clone());
            call.call_id = call_id.or_else(|| leg.id());
            call.leg = Some(leg);
            let info = IncomingCallInfo {
                call_id: call.call_id.clone(),
                from: from.clone(),
                received_at: call.created_at,
            };
            slot.call = Some(call);
            slot.note = None;
            slot.muted = false;
            slot.on_hold = false;
            slot.last_call = None;
            self.transition(&mut slot, CallState::Incoming, Some(format!("Incoming call from {}", from)));
            info
        };

        info!(from = %from, call_id = ?info.call_id, "Incoming call");
        self.diagnostics.note(format!("Incoming call from {}", from));
        self.diagnostics.emit(ClientEvent::IncomingCall {
            info,
            priority: EventPriority::High,
        });
    }

    /// Drop a pending incoming call back to idle without a log record
    fn clear_pending(&self, epoch: u64, reason: &str) -> bool {
        let mut slot = self.inner.lock();
        if !slot.is_current(epoch) || slot.state != CallState::Incoming {
            return false;
        }
        slot.call = None;
        self.transition(&mut slot, CallState::Idle, Some(reason.to_string()));
        true
    }

    fn pending_incoming(&self) -> ClientResult<(Arc<dyn CallLeg>, u64, String)> {
        let slot = self.inner.lock();
        let leg = match (slot.state, &slot.call) {
            (CallState::Incoming, Some(call)) => call.leg.clone().map(|leg| (leg, call.counterpart.clone())),
            _ => None,
        };
        match leg {
            Some((leg, from)) => Ok((leg, slot.epoch, from)),
            None => Err(ClientError::InvalidCallState {
                expected: CallState::Incoming.to_string(),
                actual: slot.state.to_string(),
            }),
        }
    }

    /// Move the call started at `epoch` to a terminal state and finalize its
    /// log. Only the first caller for a given call does anything.
    ///
    /// The store write runs in the background. A call whose record is still
    /// being created leaves its outcome in the slot for
    /// [`open_log`](Self::open_log) to write.
    pub(crate) fn finish(self: &Arc<Self>, epoch: u64, outcome: CallState, reason: String) {
        let status = match outcome {
            CallState::Failed => CallLogStatus::Failed,
            _ => CallLogStatus::Completed,
        };
        let (call, note, duration) = {
            let mut slot = self.inner.lock();
            if !slot.is_current(epoch) {
                debug!(epoch, outcome = %outcome, "Call already finished");
                return;
            }
            let Some(mut call) = slot.call.take() else {
                return;
            };
            let note = slot.note.take();
            let duration = elapsed_secs(call.started_at);
            if call.log == LogLink::Pending {
                slot.unlogged.insert(
                    epoch,
                    EndedCall {
                        status,
                        duration_secs: duration,
                        note: note.clone(),
                    },
                );
                call.log = LogLink::Detached;
            }
            slot.muted = false;
            slot.on_hold = false;
            slot.last_call = Some(call.info());
            self.transition(&mut slot, outcome, Some(reason.clone()));
            (call, note, duration)
        };

        info!(
            counterpart = %call.counterpart,
            direction = %call.direction,
            outcome = %outcome,
            duration_secs = duration,
            "Call ended"
        );
        match outcome {
            CallState::Failed => self.diagnostics.fail(reason),
            _ => self
                .diagnostics
                .note(format!("Call with {} ended after {}s", call.counterpart, duration)),
        }

        if let LogLink::Open(log_id) = call.log {
            let call_log = Arc::clone(&self.call_log);
            tokio::spawn(async move {
                call_log.finalize(&log_id, status, duration, note).await;
            });
        }

        self.schedule_idle_reset(epoch);
    }

    fn schedule_idle_reset(self: &Arc<Self>, epoch: u64) {
        let Some(delay) = self.config.terminal_reset() else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut slot = this.inner.lock();
            if slot.epoch == epoch && slot.call.is_none() && slot.state.is_terminal() {
                slot.last_call = None;
                this.transition(&mut slot, CallState::Idle, None);
            }
        });
    }

    pub(crate) fn transition(&self, slot: &mut CallSlot, new_state: CallState, reason: Option<String>) {
        let previous = slot.state;
        slot.state = new_state;
        let status = slot.status();
        self.status_tx.send_replace(status.clone());

        if previous == new_state {
            return;
        }
        debug!(from = %previous, to = %new_state, reason = ?reason, "Call state changed");
        let call = status.call.as_ref();
        let priority = match new_state {
            CallState::Failed | CallState::Incoming => EventPriority::High,
            _ => EventPriority::Normal,
        };
        self.diagnostics.emit(ClientEvent::CallStateChanged {
            info: CallStatusInfo {
                call_id: call.and_then(|c| c.call_id.clone()),
                direction: call.map(|c| c.direction),
                new_state,
                previous_state: previous,
                reason,
                timestamp: Utc::now(),
            },
            priority,
        });
    }

    /// Push the current slot to watchers without a state change
    pub(crate) fn publish(&self, slot: &CallSlot) {
        self.status_tx.send_replace(slot.status());
    }
}

fn elapsed_secs(started_at: Option<DateTime<Utc>>) -> u64 {
    started_at
        .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
        .unwrap_or(0)
}
