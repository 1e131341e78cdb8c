//! One-on-one offer/answer handshake.
//!
//! The caller's offer is held in a [`SignalingExchange`] until the callee
//! answers, declines, or the ring timeout fires. ICE candidates are relayed
//! verbatim between the two parties.

use super::{CallService, CreateCall, JoinedCall};
use crate::error::RealtimeError;
use crate::ids::generate_call_id;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vigil_protocol::{CallEndReason, CallId, CallType, ServerEvent, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ExchangeState {
    Ringing,
    /// The callee answered; the exchange is discarded once the join completes.
    Answered,
}

/// A pending handshake between a caller and a callee.
#[derive(Debug)]
pub(super) struct SignalingExchange {
    pub(super) call_id: CallId,
    pub(super) offer: Value,
    pub(super) state: ExchangeState,
    /// Whether `call:incoming` reached a live connection.
    pub(super) callee_reachable: bool,
    pub(super) timer: Option<JoinHandle<()>>,
}

impl SignalingExchange {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

type ExchangeKey = (UserId, UserId);

fn key(caller: &str, callee: &str) -> ExchangeKey {
    (caller.to_string(), callee.to_string())
}

impl CallService {
    /// Start a one-on-one call and ring the callee.
    ///
    /// An offline callee is not an error: the call rings until the timeout
    /// ends it as `unreachable`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEvent` for a self-call, `Forbidden` if the directory
    /// denies contact, `CallBusy` if either party is already ringing or in
    /// a one-on-one call, or `Persistence`.
    pub async fn initiate(
        self: &Arc<Self>,
        caller: &str,
        callee: &str,
        offer: Value,
    ) -> Result<CallId, RealtimeError> {
        if caller == callee {
            return Err(RealtimeError::InvalidEvent("cannot call yourself".to_string()));
        }

        // Hold both parties before the first await; a concurrent caller
        // then finds them busy.
        let call_id = generate_call_id();
        self.engage([caller, callee], &call_id)?;
        if let Err(e) = self.open_one_on_one(&call_id, caller, callee).await {
            self.release(&call_id);
            return Err(e);
        }

        self.exchanges.insert(
            key(caller, callee),
            SignalingExchange {
                call_id: call_id.clone(),
                offer: offer.clone(),
                state: ExchangeState::Ringing,
                callee_reachable: false,
                timer: None,
            },
        );

        let reachable = self.registry.deliver(
            callee,
            Arc::new(ServerEvent::CallIncoming {
                call_id: call_id.clone(),
                caller_id: caller.to_string(),
                offer,
            }),
        );

        let timer = self.arm_ring_timer(caller, callee);
        match self.exchanges.get_mut(&key(caller, callee)) {
            Some(mut exchange) if exchange.call_id == call_id => {
                exchange.callee_reachable = reachable;
                exchange.timer = Some(timer);
            }
            // Resolved before the timer was armed.
            _ => timer.abort(),
        }

        info!(call = %call_id, caller = %caller, callee = %callee, reachable, "Ringing");
        Ok(call_id)
    }

    async fn open_one_on_one(
        &self,
        call_id: &CallId,
        caller: &str,
        callee: &str,
    ) -> Result<(), RealtimeError> {
        if !self.store.can_contact(caller, callee).await? {
            return Err(RealtimeError::Forbidden(format!(
                "{caller} may not call {callee}"
            )));
        }
        self.create_with_id(
            call_id.clone(),
            caller,
            CreateCall {
                call_type: Some(CallType::OneOnOne),
                invited: vec![callee.to_string()],
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Hold every party for `call_id`, or none of them.
    fn engage(&self, parties: [&str; 2], call_id: &CallId) -> Result<(), RealtimeError> {
        for (i, party) in parties.iter().enumerate() {
            let claimed = !self.in_one_on_one(party)
                && match self.engaged.entry((*party).to_string()) {
                    Entry::Occupied(_) => false,
                    Entry::Vacant(entry) => {
                        entry.insert(call_id.clone());
                        true
                    }
                };
            if !claimed {
                for held in &parties[..i] {
                    self.engaged.remove_if(*held, |_, id| id == call_id);
                }
                return Err(RealtimeError::CallBusy((*party).to_string()));
            }
        }
        Ok(())
    }

    /// Free the parties held for `call_id`.
    pub(super) fn release(&self, call_id: &str) {
        self.engaged.retain(|_, id| *id != call_id);
    }

    /// The callee joined its ringing call without answering; the handshake
    /// is over and the ring timer must not fire.
    pub(super) fn settle_exchange(&self, call_id: &str, callee: &str) {
        self.exchanges.retain(|key, exchange| {
            let settled = exchange.call_id == call_id && key.1 == callee;
            if settled {
                exchange.cancel_timer();
            }
            !settled
        });
    }

    fn arm_ring_timer(self: &Arc<Self>, caller: &str, callee: &str) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let timeout = self.config.ring_timeout;
        let caller = caller.to_string();
        let callee = callee.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(service) = service.upgrade() {
                service.ring_timeout(&caller, &callee).await;
            }
        })
    }

    async fn ring_timeout(&self, caller: &str, callee: &str) {
        let Some((_, exchange)) = self
            .exchanges
            .remove_if(&key(caller, callee), |_, e| e.state == ExchangeState::Ringing)
        else {
            return;
        };

        let reason = if exchange.callee_reachable {
            CallEndReason::NoAnswer
        } else {
            CallEndReason::Unreachable
        };
        info!(call = %exchange.call_id, caller = %caller, callee = %callee, ?reason, "Ring timed out");

        if self.close_call(&exchange.call_id).await.is_none() {
            return;
        }
        self.registry.deliver(
            caller,
            Arc::new(ServerEvent::CallEnded {
                call_id: exchange.call_id.clone(),
                user_id: callee.to_string(),
                reason,
            }),
        );
        if exchange.callee_reachable {
            self.registry.deliver(
                callee,
                Arc::new(ServerEvent::CallEnded {
                    call_id: exchange.call_id,
                    user_id: caller.to_string(),
                    reason: CallEndReason::NoAnswer,
                }),
            );
        }
    }

    /// Accept a ringing call and forward the answer to the caller.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if `caller` is not ringing `callee`, or any
    /// error of [`CallService::join_call`].
    pub async fn answer(
        &self,
        callee: &str,
        caller: &str,
        answer: Value,
    ) -> Result<JoinedCall, RealtimeError> {
        let call_id = {
            let mut exchange = self
                .exchanges
                .get_mut(&key(caller, callee))
                .filter(|e| e.state == ExchangeState::Ringing)
                .ok_or_else(|| {
                    RealtimeError::Forbidden(format!("{caller} is not calling {callee}"))
                })?;
            exchange.state = ExchangeState::Answered;
            exchange.cancel_timer();
            exchange.call_id.clone()
        };

        let joined = self.join_call(&call_id, callee).await;
        self.exchanges.remove(&key(caller, callee));
        let joined = joined?;

        self.registry.deliver(
            caller,
            Arc::new(ServerEvent::CallAnswered {
                call_id: call_id.clone(),
                callee_id: callee.to_string(),
                answer,
            }),
        );
        info!(call = %call_id, caller = %caller, callee = %callee, "Call answered");
        Ok(joined)
    }

    /// Decline a ringing call.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if `caller` is not ringing `callee`.
    pub async fn reject(&self, callee: &str, caller: &str) -> Result<(), RealtimeError> {
        let (_, mut exchange) = self
            .exchanges
            .remove_if(&key(caller, callee), |_, e| e.state == ExchangeState::Ringing)
            .ok_or_else(|| RealtimeError::Forbidden(format!("{caller} is not calling {callee}")))?;
        exchange.cancel_timer();

        if self.close_call(&exchange.call_id).await.is_some() {
            self.registry.deliver(
                caller,
                Arc::new(ServerEvent::CallEnded {
                    call_id: exchange.call_id.clone(),
                    user_id: callee.to_string(),
                    reason: CallEndReason::Rejected,
                }),
            );
        }
        info!(call = %exchange.call_id, caller = %caller, callee = %callee, "Call rejected");
        Ok(())
    }

    /// Relay an ICE candidate to the other party. Dropped silently if the
    /// target is offline.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the two users share no handshake or
    /// one-on-one call.
    pub fn exchange_ice_candidate(
        &self,
        from: &str,
        to: &str,
        candidate: Value,
    ) -> Result<(), RealtimeError> {
        let call_id = self
            .shared_call(from, to)
            .ok_or_else(|| RealtimeError::Forbidden(format!("{from} has no call with {to}")))?;

        let delivered = self.registry.deliver(
            to,
            Arc::new(ServerEvent::CallIceCandidate {
                call_id,
                user_id: from.to_string(),
                candidate,
            }),
        );
        debug!(from = %from, to = %to, delivered, "ICE candidate relayed");
        Ok(())
    }

    /// The handshake or live one-on-one call two users share.
    fn shared_call(&self, a: &str, b: &str) -> Option<CallId> {
        if let Some(exchange) = self.exchanges.get(&key(a, b)) {
            return Some(exchange.call_id.clone());
        }
        if let Some(exchange) = self.exchanges.get(&key(b, a)) {
            return Some(exchange.call_id.clone());
        }
        self.calls
            .iter()
            .find(|call| {
                call.call_type == CallType::OneOnOne
                    && call.participants.contains_key(a)
                    && call.participants.contains_key(b)
            })
            .map(|call| call.key().clone())
    }

    /// Hang up whatever one-on-one call `user` has with `peer`.
    ///
    /// A caller hanging up a ringing call cancels it; a callee hanging up
    /// declines it; a live call is left. Nothing in progress is a no-op.
    ///
    /// # Errors
    ///
    /// Returns errors of [`CallService::leave_call`].
    pub async fn hang_up(&self, user: &str, peer: &str) -> Result<(), RealtimeError> {
        if let Some((_, mut exchange)) = self
            .exchanges
            .remove_if(&key(user, peer), |_, e| e.state == ExchangeState::Ringing)
        {
            exchange.cancel_timer();
            if self.close_call(&exchange.call_id).await.is_some() {
                self.registry.deliver(
                    peer,
                    Arc::new(ServerEvent::CallEnded {
                        call_id: exchange.call_id,
                        user_id: user.to_string(),
                        reason: CallEndReason::Cancelled,
                    }),
                );
            }
            return Ok(());
        }

        if self.exchanges.contains_key(&key(peer, user)) {
            return self.reject(user, peer).await;
        }

        match self.shared_call(user, peer) {
            Some(call_id) => self.leave_call(&call_id, user).await.map(|_| ()),
            None => {
                debug!(user = %user, peer = %peer, "Nothing to hang up");
                Ok(())
            }
        }
    }

    /// Cancel every handshake `user` takes part in; the counterpart is told
    /// the peer disconnected.
    pub(super) async fn cancel_exchanges_of(&self, user: &str) {
        let keys: Vec<ExchangeKey> = self
            .exchanges
            .iter()
            .filter(|e| e.key().0 == user || e.key().1 == user)
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            let Some((_, mut exchange)) = self.exchanges.remove(&key) else {
                continue;
            };
            exchange.cancel_timer();
            let counterpart = if key.0 == user { &key.1 } else { &key.0 };

            if self.close_call(&exchange.call_id).await.is_some() {
                self.registry.deliver(
                    counterpart,
                    Arc::new(ServerEvent::CallEnded {
                        call_id: exchange.call_id,
                        user_id: user.to_string(),
                        reason: CallEndReason::PeerDisconnected,
                    }),
                );
            }
        }
    }

    /// Drop the handshakes of a call that is closing.
    pub(super) fn cancel_exchanges_for(&self, call_id: &str) {
        self.exchanges.retain(|_, exchange| {
            if exchange.call_id == call_id {
                exchange.cancel_timer();
                false
            } else {
                true
            }
        });
    }

    /// The offer a caller is ringing a callee with.
    #[must_use]
    pub fn pending_offer(&self, caller: &str, callee: &str) -> Option<Value> {
        self.exchanges
            .get(&key(caller, callee))
            .map(|e| e.offer.clone())
    }
}
