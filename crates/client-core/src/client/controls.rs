//! In-call controls: mute, hold, DTMF and the call note
//!
//! Control failures never change call state. The SDK error is reported to
//! the event feed and returned as [`ClientError::CallControl`]; the local
//! flags keep their previous values.

use tracing::{debug, warn};

use super::calls::CallMachine;
use crate::call::{sanitize_dtmf, CallState};
use crate::error::{ClientError, ClientResult};

impl CallMachine {
    /// Flip the microphone mute. Returns the new mute flag.
    ///
    /// With no live call this is a no-op returning the current flag.
    pub async fn toggle_mute(&self) -> ClientResult<bool> {
        let (leg, epoch, desired) = {
            let slot = self.inner.lock();
            let leg = slot.call.as_ref().and_then(|c| c.leg.clone());
            match leg {
                Some(leg) if slot.state.is_live() => (leg, slot.epoch, !slot.muted),
                _ => {
                    debug!(state = %slot.state, "Mute toggle with no live call");
                    return Ok(slot.muted);
                }
            }
        };

        if let Err(e) = leg.mute(desired).await {
            let action = if desired { "Mute" } else { "Unmute" };
            let err = ClientError::call_control(format!("{} failed: {}", action, e));
            warn!(error = %e, "{} failed", action);
            self.diagnostics.note(err.to_string());
            return Err(err);
        }

        {
            let mut slot = self.inner.lock();
            if slot.is_current(epoch) {
                slot.muted = desired;
                self.publish(&slot);
            }
        }
        self.diagnostics
            .note(if desired { "Microphone muted" } else { "Microphone unmuted" });
        Ok(desired)
    }

    /// Put the call on hold or resume it. Returns the new hold flag.
    pub async fn toggle_hold(&self) -> ClientResult<bool> {
        let (leg, epoch, desired) = {
            let slot = self.inner.lock();
            let leg = slot.call.as_ref().and_then(|c| c.leg.clone());
            match (slot.state, leg) {
                (CallState::Active, Some(leg)) => (leg, slot.epoch, true),
                (CallState::Held, Some(leg)) => (leg, slot.epoch, false),
                (state, _) => {
                    debug!(state = %state, "Hold toggle with no connected call");
                    return Ok(slot.on_hold);
                }
            }
        };

        if let Err(e) = leg.hold(desired).await {
            let action = if desired { "Hold" } else { "Resume" };
            let err = ClientError::call_control(format!("{} failed: {}", action, e));
            warn!(error = %e, "{} failed", action);
            self.diagnostics.note(err.to_string());
            return Err(err);
        }

        {
            let mut slot = self.inner.lock();
            if slot.is_current(epoch) && slot.state.is_connected() {
                slot.on_hold = desired;
                let (next, reason) = if desired {
                    (CallState::Held, "On hold")
                } else {
                    (CallState::Active, "Resumed")
                };
                self.transition(&mut slot, next, Some(reason.to_string()));
            }
        }
        self.diagnostics.note(if desired { "Call on hold" } else { "Call resumed" });
        Ok(desired)
    }

    /// Send DTMF tones on the active call.
    ///
    /// Input is upper-cased and filtered to the tone alphabet. Returns
    /// `false` when nothing was sent: no active call, nothing left after
    /// filtering, or the SDK refused.
    pub async fn send_digits(&self, input: &str) -> bool {
        let digits = sanitize_dtmf(input);
        if digits.is_empty() {
            debug!(input = %input, "No DTMF tones in input");
            return false;
        }

        let leg = {
            let slot = self.inner.lock();
            match (slot.state, slot.call.as_ref().and_then(|c| c.leg.clone())) {
                (CallState::Active, Some(leg)) => leg,
                (state, _) => {
                    debug!(state = %state, "DTMF with no active call");
                    return false;
                }
            }
        };

        match leg.send_digits(&digits).await {
            Ok(()) => {
                self.diagnostics.note(format!("Sent tones {}", digits));
                true
            }
            Err(e) => {
                warn!(error = %e, "DTMF failed");
                self.diagnostics.note(format!("Failed to send tones: {}", e));
                false
            }
        }
    }

    /// Attach free text to the current call's log record.
    ///
    /// Blank text clears the note.
    pub fn set_note(&self, text: &str) {
        let text = text.trim();
        self.inner.lock().note = if text.is_empty() { None } else { Some(text.to_string()) };
    }

    pub fn note(&self) -> Option<String> {
        self.inner.lock().note.clone()
    }
}
