//! HAP two-step PIN pairing state machine.
//!
//! ```text
//! Unauthenticated ─begin─▶ PinRequested(1) ─pin ok─▶ StepVerified(1)
//!        ▲                    │  ▲ wrong pin              │
//!        │                    └──┘ (bounded)              ▼
//!        │                                        PinRequested(2) ─pin ok─▶ StepVerified(2) ─finish─▶ Ready
//!        └──────── attempts exhausted / timeout / abandon ◀─────────────────────┘
//! ```
//!
//! The machine only produces credentials. Storing them is the caller's job.
//! Legacy (AirPlay 1) speakers never enter this machine beyond
//! `Unauthenticated → Ready`.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{PairingBackend, SessionError, SessionTarget};
use crate::airplay::types::{PairingCredential, PairingStep};
use crate::error::{SpeakerError, SpeakerResult};
use crate::utils::bounded;

/// Authentication state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "camelCase")]
pub enum AuthState {
    Unauthenticated,
    PinRequested(PairingStep),
    StepVerified(PairingStep),
    Ready,
}

/// Successful outcome of a pairing call.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingProgress {
    /// The device is showing a PIN for `step`.
    PinRequested(PairingStep),
    /// The PIN was wrong; the same step accepts another attempt.
    Retry {
        step: PairingStep,
        attempts_left: u32,
    },
    /// Both steps verified; here is the long-term credential.
    Completed(PairingCredential),
}

/// How the previous pairing attempt ended, kept for late callers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    TimedOut,
    Failed(String),
}

/// Read-only view of a pairing flow for the outward surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatus {
    pub auth_state: AuthState,
    pub attempts_left: Option<u32>,
    /// Seconds left to enter the current PIN.
    pub expires_in_secs: Option<u64>,
    pub last_error: Option<String>,
}

/// Everything a pairing call needs besides the machine itself.
pub struct PairingContext<'a, B: PairingBackend + ?Sized> {
    pub backend: &'a B,
    pub target: &'a SessionTarget,
    /// Deadline for each individual device call.
    pub call_timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Per-identity pairing state machine.
#[derive(Debug)]
pub struct PairingMachine {
    state: AuthState,
    wrong_pins: u32,
    deadline: Option<Instant>,
    max_attempts: u32,
    pin_timeout: Duration,
    last_outcome: Option<Outcome>,
}

impl PairingMachine {
    pub fn new(max_attempts: u32, pin_timeout: Duration) -> Self {
        Self {
            state: AuthState::Unauthenticated,
            wrong_pins: 0,
            deadline: None,
            max_attempts: max_attempts.max(1),
            pin_timeout,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            AuthState::PinRequested(_) | AuthState::StepVerified(_)
        )
    }

    /// Marks the identity authenticated without a PIN exchange (stored
    /// credential or legacy speaker).
    pub fn mark_ready(&mut self) {
        self.state = AuthState::Ready;
        self.wrong_pins = 0;
        self.deadline = None;
        self.last_outcome = None;
    }

    /// Returns to `Unauthenticated`, e.g. after the device rejected the
    /// stored credential.
    pub fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.wrong_pins = 0;
        self.deadline = None;
    }

    pub fn status(&self) -> PairingStatus {
        let waiting = matches!(self.state, AuthState::PinRequested(_));
        PairingStatus {
            auth_state: self.state,
            attempts_left: waiting.then(|| self.max_attempts.saturating_sub(self.wrong_pins)),
            expires_in_secs: self
                .deadline
                .filter(|_| waiting)
                .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs()),
            last_error: self.last_outcome.as_ref().map(|outcome| match outcome {
                Outcome::TimedOut => "PIN entry timed out".to_string(),
                Outcome::Failed(reason) => reason.clone(),
            }),
        }
    }

    /// Starts (or restarts) the flow at step 1.
    pub async fn begin<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
    ) -> SpeakerResult<PairingProgress> {
        if self.is_in_progress() {
            log::info!("[Pairing] Restarting pairing for {}", ctx.target.id);
            abort_within(ctx).await;
        }
        self.reset();
        self.last_outcome = None;
        self.request(ctx, PairingStep::One).await
    }

    /// Submits a user-supplied PIN for the current step.
    pub async fn submit<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
        pin: &str,
    ) -> SpeakerResult<PairingProgress> {
        let id = &ctx.target.id;
        let step = match self.state {
            AuthState::PinRequested(step) => step,
            _ => {
                return Err(match self.last_outcome {
                    Some(Outcome::TimedOut) => SpeakerError::PairingTimeout(id.clone()),
                    _ => SpeakerError::PairingNotActive(id.clone()),
                });
            }
        };

        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.expire(ctx).await;
            return Err(SpeakerError::PairingTimeout(id.clone()));
        }

        match bounded(
            ctx.cancel,
            ctx.call_timeout,
            ctx.backend.verify_pin(ctx.target, step, pin),
        )
        .await
        {
            Ok(()) => {
                self.state = AuthState::StepVerified(step);
                log::info!("[Pairing] {} verified step {}", id, step.number());
                match step {
                    PairingStep::One => self.request(ctx, PairingStep::Two).await,
                    PairingStep::Two => self.complete(ctx).await,
                }
            }
            Err(SessionError::WrongPin) => {
                self.wrong_pins += 1;
                let attempts_left = self.max_attempts.saturating_sub(self.wrong_pins);
                log::warn!(
                    "[Pairing] Wrong PIN for {} at step {} ({} attempt(s) left)",
                    id,
                    step.number(),
                    attempts_left
                );
                if attempts_left == 0 {
                    Err(self
                        .fail(ctx, format!("too many wrong PINs at step {}", step.number()))
                        .await)
                } else {
                    Ok(PairingProgress::Retry {
                        step,
                        attempts_left,
                    })
                }
            }
            Err(e) => Err(self.fail(ctx, e.to_string()).await),
        }
    }

    /// Times out a waiting flow whose PIN window has passed.
    ///
    /// Returns true if the flow was expired by this call.
    pub async fn expire_if_due<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
    ) -> bool {
        let due = matches!(self.state, AuthState::PinRequested(_))
            && self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if due {
            self.expire(ctx).await;
        }
        due
    }

    /// Discards any partial key-exchange state.
    ///
    /// Runs after cancellation, so the device abort is bounded only by
    /// `ctx.call_timeout`.
    pub async fn abandon<B: PairingBackend + ?Sized>(&mut self, ctx: &PairingContext<'_, B>) {
        if self.is_in_progress() {
            log::info!("[Pairing] Abandoning pairing for {}", ctx.target.id);
            abort_within(ctx).await;
        }
        if self.state != AuthState::Ready {
            self.reset();
        }
    }

    async fn request<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
        step: PairingStep,
    ) -> SpeakerResult<PairingProgress> {
        if let Err(e) = bounded(
            ctx.cancel,
            ctx.call_timeout,
            ctx.backend.request_pin(ctx.target, step),
        )
        .await
        {
            return Err(self.fail(ctx, e.to_string()).await);
        }

        self.state = AuthState::PinRequested(step);
        self.wrong_pins = 0;
        self.deadline = Some(Instant::now() + self.pin_timeout);
        log::info!(
            "[Pairing] {} is showing a PIN for step {}",
            ctx.target.id,
            step.number()
        );
        Ok(PairingProgress::PinRequested(step))
    }

    async fn complete<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
    ) -> SpeakerResult<PairingProgress> {
        match bounded(ctx.cancel, ctx.call_timeout, ctx.backend.finish(ctx.target)).await {
            Ok(credential) => {
                self.mark_ready();
                log::info!("[Pairing] {} paired", ctx.target.id);
                Ok(PairingProgress::Completed(credential))
            }
            Err(e) => Err(self.fail(ctx, e.to_string()).await),
        }
    }

    async fn expire<B: PairingBackend + ?Sized>(&mut self, ctx: &PairingContext<'_, B>) {
        log::warn!("[Pairing] PIN window expired for {}", ctx.target.id);
        abort_within(ctx).await;
        self.reset();
        self.last_outcome = Some(Outcome::TimedOut);
    }

    async fn fail<B: PairingBackend + ?Sized>(
        &mut self,
        ctx: &PairingContext<'_, B>,
        reason: String,
    ) -> SpeakerError {
        log::warn!("[Pairing] Pairing failed for {}: {}", ctx.target.id, reason);
        abort_within(ctx).await;
        self.reset();
        self.last_outcome = Some(Outcome::Failed(reason.clone()));
        SpeakerError::PairingFailed {
            id: ctx.target.id.clone(),
            reason,
        }
    }
}

/// Tells the device to drop the exchange, giving up after one call timeout.
async fn abort_within<B: PairingBackend + ?Sized>(ctx: &PairingContext<'_, B>) {
    if tokio::time::timeout(ctx.call_timeout, ctx.backend.abort(ctx.target))
        .await
        .is_err()
    {
        log::warn!(
            "[Pairing] Abort for {} did not finish within {:?}",
            ctx.target.id,
            ctx.call_timeout
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::airplay::types::ProtocolVersion;
    use crate::test_fixtures::{target, Call, FakeBackend, GOOD_PIN, PAIRED_SECRET};

    fn machine() -> PairingMachine {
        PairingMachine::new(3, Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn two_steps_produce_a_credential() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();

        assert_eq!(
            m.begin(&ctx).await.unwrap(),
            PairingProgress::PinRequested(PairingStep::One)
        );
        assert_eq!(
            m.submit(&ctx, GOOD_PIN).await.unwrap(),
            PairingProgress::PinRequested(PairingStep::Two)
        );
        let done = m.submit(&ctx, GOOD_PIN).await.unwrap();
        assert_eq!(
            done,
            PairingProgress::Completed(PairingCredential::new(PAIRED_SECRET))
        );
        assert_eq!(m.state(), AuthState::Ready);

        let log = backend.log();
        assert!(log.contains(&Call::RequestPin(target.id.clone(), 1)));
        assert!(log.contains(&Call::RequestPin(target.id.clone(), 2)));
        assert!(log.contains(&Call::Finish(target.id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn three_wrong_pins_fail_pairing() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        m.begin(&ctx).await.unwrap();

        assert_eq!(
            m.submit(&ctx, "0000").await.unwrap(),
            PairingProgress::Retry {
                step: PairingStep::One,
                attempts_left: 2
            }
        );
        assert_eq!(
            m.submit(&ctx, "0000").await.unwrap(),
            PairingProgress::Retry {
                step: PairingStep::One,
                attempts_left: 1
            }
        );
        let err = m.submit(&ctx, "0000").await.unwrap_err();
        assert!(matches!(err, SpeakerError::PairingFailed { .. }));
        assert_eq!(m.state(), AuthState::Unauthenticated);
        assert!(backend.log().contains(&Call::Abort(target.id.clone())));

        // A correct PIN afterwards does not resurrect the flow.
        assert!(matches!(
            m.submit(&ctx, GOOD_PIN).await,
            Err(SpeakerError::PairingNotActive(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn late_pin_times_out_instead_of_succeeding() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        m.begin(&ctx).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;

        let err = m.submit(&ctx, GOOD_PIN).await.unwrap_err();
        assert!(matches!(err, SpeakerError::PairingTimeout(_)));
        assert_ne!(m.state(), AuthState::Ready);
        assert!(!backend
            .log()
            .iter()
            .any(|call| matches!(call, Call::VerifyPin(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_keeps_timeout_for_late_submit() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        m.begin(&ctx).await.unwrap();
        assert!(!m.expire_if_due(&ctx).await);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(m.expire_if_due(&ctx).await);
        assert_eq!(m.state(), AuthState::Unauthenticated);
        assert!(matches!(
            m.submit(&ctx, GOOD_PIN).await,
            Err(SpeakerError::PairingTimeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_gives_up_on_a_hung_abort() {
        let backend = FakeBackend::new();
        backend.abort_delay_ms.store(3_600_000, Ordering::SeqCst);
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        m.begin(&ctx).await.unwrap();
        cancel.cancel();

        let started = Instant::now();
        m.abandon(&ctx).await;

        assert!(started.elapsed() <= Duration::from_secs(10) + Duration::from_millis(100));
        assert_eq!(m.state(), AuthState::Unauthenticated);
        assert!(backend.log().contains(&Call::Abort(target.id.clone())));
    }

    #[tokio::test]
    async fn submit_without_flow_is_rejected() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        assert!(matches!(
            m.submit(&ctx, GOOD_PIN).await,
            Err(SpeakerError::PairingNotActive(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_attempts_and_window() {
        let backend = FakeBackend::new();
        let target = target("AA:BB", ProtocolVersion::AirPlay2);
        let cancel = CancellationToken::new();
        let ctx = PairingContext {
            backend: &*backend,
            target: &target,
            call_timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        let mut m = machine();
        m.begin(&ctx).await.unwrap();
        m.submit(&ctx, "9999").await.unwrap();

        let status = m.status();
        assert_eq!(status.auth_state, AuthState::PinRequested(PairingStep::One));
        assert_eq!(status.attempts_left, Some(2));
        assert!(status.expires_in_secs.is_some());
    }
}
