//! Call sessions.
//!
//! Tracks the lifecycle of one-on-one and group calls hosted on an external
//! RTC network: creation, join/leave, host end, and per-participant media
//! state. The one-on-one offer/answer handshake lives in [`signaling`].
//!
//! Call state is mutated inside short synchronous `DashMap` critical
//! sections; persistence and token minting happen after the guard is
//! released.

mod signaling;

use crate::error::RealtimeError;
use crate::ids::{generate_call_id, now_millis};
use crate::registry::ConnectionRegistry;
use crate::store::{RtcGrant, RtcTokenIssuer, Store};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vigil_protocol::{
    CallCredentials, CallEndReason, CallId, CallStatus, CallSummary, CallType, MediaStatePatch,
    ParticipantInfo, ServerEvent, UserId,
};

use signaling::SignalingExchange;

/// Call service configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Application id on the RTC network.
    pub app_id: String,
    /// Upper bound for `max_participants` of a group call.
    pub max_participants: usize,
    /// How long a one-on-one call rings before it is given up.
    pub ring_timeout: Duration,
    /// How long an ended call id keeps answering `CallEnded`.
    pub ended_retention: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            app_id: "vigil".to_string(),
            max_participants: 16,
            ring_timeout: Duration::from_secs(30),
            ended_retention: Duration::from_secs(3600),
        }
    }
}

/// Request to create a call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCall {
    /// Defaults to a group call.
    #[serde(rename = "type", default)]
    pub call_type: Option<CallType>,
    #[serde(default)]
    pub purpose: Option<String>,
    /// A time in the future schedules the call instead of starting it.
    #[serde(default)]
    pub scheduled_at: Option<u64>,
    /// Users allowed to join besides the host. Empty means open.
    #[serde(default)]
    pub invited: Vec<UserId>,
    #[serde(default)]
    pub max_participants: Option<usize>,
}

/// A newly created call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedCall {
    pub call: CallSummary,
    /// The host's credentials, when the call started immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CallCredentials>,
}

/// A successful join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedCall {
    pub call: CallSummary,
    pub credentials: CallCredentials,
}

#[derive(Debug, Clone)]
struct Call {
    id: CallId,
    host_id: UserId,
    call_type: CallType,
    purpose: Option<String>,
    status: CallStatus,
    scheduled_at: Option<u64>,
    channel_name: String,
    max_participants: usize,
    invited: BTreeSet<UserId>,
    participants: BTreeMap<UserId, ParticipantInfo>,
    next_uid: u32,
}

impl Call {
    fn summary(&self) -> CallSummary {
        CallSummary {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            call_type: self.call_type,
            purpose: self.purpose.clone(),
            status: self.status,
            scheduled_at: self.scheduled_at,
            channel_name: self.channel_name.clone(),
            max_participants: self.max_participants,
            participants: self.participants.values().cloned().collect(),
        }
    }

    fn is_joined(&self, user_id: &str) -> bool {
        self.participants
            .get(user_id)
            .map(ParticipantInfo::is_joined)
            .unwrap_or(false)
    }

    fn joined(&self) -> Vec<UserId> {
        self.participants
            .values()
            .filter(|p| p.is_joined())
            .map(|p| p.user_id.clone())
            .collect()
    }

    fn joined_except(&self, user_id: &str) -> Vec<UserId> {
        self.joined().into_iter().filter(|u| u != user_id).collect()
    }

    /// Invitees and everyone who ever joined, except `user_id`.
    fn audience_except(&self, user_id: &str) -> Vec<UserId> {
        let mut audience: BTreeSet<UserId> = self.invited.clone();
        audience.extend(self.participants.keys().cloned());
        audience.insert(self.host_id.clone());
        audience.remove(user_id);
        audience.into_iter().collect()
    }

    fn admit(&self, user_id: &str) -> Result<(), RealtimeError> {
        if !self.invited.is_empty() && !self.invited.contains(user_id) && self.host_id != user_id {
            return Err(RealtimeError::Forbidden(format!(
                "{user_id} is not invited to call {}",
                self.id
            )));
        }
        if !self.is_joined(user_id) && self.joined().len() >= self.max_participants {
            return Err(RealtimeError::CallFull);
        }
        Ok(())
    }

    fn uid_for(&mut self, user_id: &str) -> u32 {
        match self.participants.get(user_id) {
            Some(participant) => participant.uid,
            None => {
                let uid = self.next_uid;
                self.next_uid += 1;
                uid
            }
        }
    }

    fn upsert(&mut self, user_id: &str, uid: u32) -> ParticipantInfo {
        let now = now_millis();
        let participant = self
            .participants
            .entry(user_id.to_string())
            .or_insert_with(|| ParticipantInfo {
                user_id: user_id.to_string(),
                uid,
                is_muted: false,
                is_video_off: false,
                is_screen_sharing: false,
                joined_at: now,
                left_at: None,
            });
        participant.uid = uid;
        participant.joined_at = now;
        participant.left_at = None;
        let participant = participant.clone();

        if self.status == CallStatus::Scheduled {
            self.status = CallStatus::Active;
        }
        participant
    }
}

/// The call signaling service.
pub struct CallService {
    calls: DashMap<CallId, Call>,
    /// Recently ended calls; joins fail with `CallEnded` rather than
    /// `CallNotFound` until [`CallService::prune_ended`] drops them.
    ended: DashMap<CallId, Instant>,
    /// Pending one-on-one handshakes keyed by (caller, callee).
    exchanges: DashMap<(UserId, UserId), SignalingExchange>,
    /// Users held by a ringing or live one-on-one call.
    engaged: DashMap<UserId, CallId>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    issuer: Arc<dyn RtcTokenIssuer>,
    config: CallConfig,
}

impl CallService {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        issuer: Arc<dyn RtcTokenIssuer>,
        config: CallConfig,
    ) -> Self {
        Self {
            calls: DashMap::new(),
            ended: DashMap::new(),
            exchanges: DashMap::new(),
            engaged: DashMap::new(),
            registry,
            store,
            issuer,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Number of calls not yet ended.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.calls.len()
    }

    fn missing(&self, call_id: &str) -> RealtimeError {
        if self.ended.contains_key(call_id) {
            RealtimeError::CallEnded
        } else {
            RealtimeError::CallNotFound(call_id.to_string())
        }
    }

    async fn credentials(
        &self,
        channel_name: &str,
        uid: u32,
        user_id: &str,
    ) -> Result<CallCredentials, RealtimeError> {
        let token = self
            .issuer
            .issue(RtcGrant {
                app_id: &self.config.app_id,
                channel_name,
                uid,
                user_id,
            })
            .await?;
        Ok(CallCredentials {
            app_id: self.config.app_id.clone(),
            channel_name: channel_name.to_string(),
            token,
            uid,
        })
    }

    async fn persist(&self, summary: &CallSummary) {
        if let Err(e) = self.store.save_call(summary).await {
            warn!(call = %summary.id, error = %e, "Failed to persist call");
        }
    }

    /// Create a call.
    ///
    /// A call scheduled in the future waits for its first participant;
    /// otherwise the host joins immediately and receives credentials.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the call could not be stored or the host's
    /// token could not be minted. No call is created in that case.
    pub async fn create_call(
        &self,
        host_id: &str,
        request: CreateCall,
    ) -> Result<CreatedCall, RealtimeError> {
        self.create_with_id(generate_call_id(), host_id, request)
            .await
    }

    async fn create_with_id(
        &self,
        id: CallId,
        host_id: &str,
        request: CreateCall,
    ) -> Result<CreatedCall, RealtimeError> {
        let call_type = request.call_type.unwrap_or(CallType::Group);
        let max_participants = match call_type {
            CallType::OneOnOne => 2,
            CallType::Group => request
                .max_participants
                .unwrap_or(self.config.max_participants)
                .clamp(2, self.config.max_participants.max(2)),
        };
        let scheduled = request
            .scheduled_at
            .map(|at| at > now_millis())
            .unwrap_or(false);

        let mut call = Call {
            channel_name: format!("{}-{}", self.config.app_id, id),
            id,
            host_id: host_id.to_string(),
            call_type,
            purpose: request.purpose,
            status: if scheduled {
                CallStatus::Scheduled
            } else {
                CallStatus::Active
            },
            scheduled_at: request.scheduled_at,
            max_participants,
            invited: request
                .invited
                .into_iter()
                .filter(|u| u != host_id)
                .collect(),
            participants: BTreeMap::new(),
            next_uid: 1,
        };

        let credentials = if scheduled {
            None
        } else {
            let uid = call.uid_for(host_id);
            let credentials = self.credentials(&call.channel_name, uid, host_id).await?;
            call.upsert(host_id, uid);
            Some(credentials)
        };

        let summary = call.summary();
        self.store.save_call(&summary).await?;
        self.calls.insert(call.id.clone(), call);

        info!(
            call = %summary.id,
            host = %host_id,
            kind = ?summary.call_type,
            status = ?summary.status,
            "Call created"
        );
        Ok(CreatedCall {
            call: summary,
            credentials,
        })
    }

    /// Snapshot of a live call.
    ///
    /// # Errors
    ///
    /// Returns `CallEnded` or `CallNotFound`.
    pub fn get_call(&self, call_id: &str) -> Result<CallSummary, RealtimeError> {
        self.calls
            .get(call_id)
            .map(|call| call.summary())
            .ok_or_else(|| self.missing(call_id))
    }

    /// Join a call, activating it if it was scheduled.
    ///
    /// Rejoining refreshes `joined_at` and does not count against the
    /// participant limit.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, `CallEnded`, `Forbidden` for users outside
    /// the invite list, `CallFull`, or `Persistence` if no token could be
    /// minted.
    pub async fn join_call(&self, call_id: &str, user_id: &str) -> Result<JoinedCall, RealtimeError> {
        let (uid, channel_name) = {
            let mut call = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| self.missing(call_id))?;
            call.admit(user_id)?;
            (call.uid_for(user_id), call.channel_name.clone())
        };

        let credentials = self.credentials(&channel_name, uid, user_id).await?;

        let (summary, participant, others) = {
            let mut call = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| self.missing(call_id))?;
            // The call may have filled up while the token was minted.
            call.admit(user_id)?;
            let participant = call.upsert(user_id, uid);
            (call.summary(), participant, call.joined_except(user_id))
        };
        if summary.call_type == CallType::OneOnOne {
            self.settle_exchange(call_id, user_id);
        }

        self.persist(&summary).await;
        self.registry.fanout(
            &others,
            ServerEvent::CallParticipantJoined {
                call_id: call_id.to_string(),
                participant,
            },
        );

        info!(call = %call_id, user = %user_id, uid, "Joined call");
        Ok(JoinedCall {
            call: summary,
            credentials,
        })
    }

    /// Leave a call. The call ends once nobody is left, or as soon as either
    /// party leaves a one-on-one call.
    ///
    /// Returns the end reason if this leave ended the call.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, `CallEnded`, or `Forbidden` if the user is
    /// not in the call.
    pub async fn leave_call(
        &self,
        call_id: &str,
        user_id: &str,
    ) -> Result<Option<CallEndReason>, RealtimeError> {
        self.leave_with(call_id, user_id, CallEndReason::HungUp)
            .await
    }

    /// Leave a call; `one_on_one_reason` is reported when the leave ends a
    /// one-on-one call.
    async fn leave_with(
        &self,
        call_id: &str,
        user_id: &str,
        one_on_one_reason: CallEndReason,
    ) -> Result<Option<CallEndReason>, RealtimeError> {
        let (remaining, audience, reason) = {
            let mut call = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| self.missing(call_id))?;
            let participant = call
                .participants
                .get_mut(user_id)
                .filter(|p| p.is_joined())
                .ok_or_else(|| {
                    RealtimeError::Forbidden(format!("{user_id} is not in call {call_id}"))
                })?;
            participant.left_at = Some(now_millis());

            let remaining = call.joined();
            let reason = if call.call_type == CallType::OneOnOne {
                Some(one_on_one_reason)
            } else if remaining.is_empty() {
                Some(CallEndReason::Completed)
            } else {
                None
            };
            (remaining, call.audience_except(user_id), reason)
        };

        self.registry.fanout(
            &remaining,
            ServerEvent::CallParticipantLeft {
                call_id: call_id.to_string(),
                user_id: user_id.to_string(),
            },
        );
        info!(call = %call_id, user = %user_id, "Left call");

        match reason {
            Some(reason) => {
                if self.close_call(call_id).await.is_some() {
                    self.registry.fanout(
                        &audience,
                        ServerEvent::CallEnded {
                            call_id: call_id.to_string(),
                            user_id: user_id.to_string(),
                            reason,
                        },
                    );
                }
                Ok(Some(reason))
            }
            None => {
                if let Ok(summary) = self.get_call(call_id) {
                    self.persist(&summary).await;
                }
                Ok(None)
            }
        }
    }

    /// End a call for everyone. Only the host may do this.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, `CallEnded`, or `Forbidden` for anyone but
    /// the host.
    pub async fn end_call(&self, call_id: &str, user_id: &str) -> Result<(), RealtimeError> {
        let targets = {
            let call = self.calls.get(call_id).ok_or_else(|| self.missing(call_id))?;
            if call.host_id != user_id {
                return Err(RealtimeError::Forbidden(
                    "only the host may end the call".to_string(),
                ));
            }
            call.joined_except(user_id)
        };

        if self.close_call(call_id).await.is_some() {
            self.registry.fanout(
                &targets,
                ServerEvent::CallEnded {
                    call_id: call_id.to_string(),
                    user_id: user_id.to_string(),
                    reason: CallEndReason::HostEnded,
                },
            );
        }
        Ok(())
    }

    /// Apply a partial media-state update and broadcast the composite
    /// state to the other participants.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, `CallEnded`, or `Forbidden` if the user is
    /// not in the call.
    pub fn update_participant_status(
        &self,
        call_id: &str,
        user_id: &str,
        patch: &MediaStatePatch,
    ) -> Result<ParticipantInfo, RealtimeError> {
        let (participant, others) = {
            let mut call = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| self.missing(call_id))?;
            let participant = call
                .participants
                .get_mut(user_id)
                .filter(|p| p.is_joined())
                .ok_or_else(|| {
                    RealtimeError::Forbidden(format!("{user_id} is not in call {call_id}"))
                })?;
            patch.apply(participant);
            let participant = participant.clone();
            (participant, call.joined_except(user_id))
        };

        debug!(call = %call_id, user = %user_id, ?patch, "Media state updated");
        self.registry.fanout(
            &others,
            ServerEvent::CallParticipantUpdated {
                call_id: call_id.to_string(),
                participant: participant.clone(),
            },
        );
        Ok(participant)
    }

    /// Reconcile a dropped connection: cancel the user's pending handshakes
    /// and leave every call they were in.
    pub async fn disconnect(&self, user_id: &str) {
        self.cancel_exchanges_of(user_id).await;

        let joined: Vec<CallId> = self
            .calls
            .iter()
            .filter(|call| call.is_joined(user_id))
            .map(|call| call.key().clone())
            .collect();
        for call_id in joined {
            if let Err(e) = self
                .leave_with(&call_id, user_id, CallEndReason::PeerDisconnected)
                .await
            {
                debug!(call = %call_id, user = %user_id, error = %e, "Leave on disconnect skipped");
            }
        }
    }

    /// Whether the user is ringing or in a one-on-one call.
    #[must_use]
    pub fn is_busy(&self, user_id: &str) -> bool {
        self.engaged.contains_key(user_id) || self.in_one_on_one(user_id)
    }

    fn in_one_on_one(&self, user_id: &str) -> bool {
        self.calls
            .iter()
            .any(|c| c.call_type == CallType::OneOnOne && c.is_joined(user_id))
    }

    /// Forget ended calls older than the retention window. Returns how many
    /// were dropped.
    pub fn prune_ended(&self) -> usize {
        let before = self.ended.len();
        let retention = self.config.ended_retention;
        self.ended.retain(|_, ended_at| ended_at.elapsed() < retention);
        let pruned = before.saturating_sub(self.ended.len());
        if pruned > 0 {
            debug!(pruned, "Pruned ended calls");
        }
        pruned
    }

    /// Remove a call, remember it as ended, and drop its handshakes.
    ///
    /// Returns `None` if another task closed it first.
    async fn close_call(&self, call_id: &str) -> Option<CallSummary> {
        let (_, mut call) = self.calls.remove(call_id)?;
        call.status = CallStatus::Ended;
        let now = now_millis();
        for participant in call.participants.values_mut() {
            participant.left_at.get_or_insert(now);
        }
        self.ended.insert(call_id.to_string(), Instant::now());
        self.cancel_exchanges_for(call_id);
        self.release(call_id);

        let summary = call.summary();
        self.persist(&summary).await;
        info!(call = %call_id, "Call ended");
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, Outbound};
    use crate::store::{InMemoryStore, UnsignedTokenIssuer};
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(super) struct Fixture {
        pub registry: Arc<ConnectionRegistry>,
        pub store: Arc<InMemoryStore>,
        pub service: Arc<CallService>,
    }

    pub(super) fn fixture() -> Fixture {
        fixture_with(InMemoryStore::new())
    }

    pub(super) fn fixture_with(store: InMemoryStore) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(store);
        let service = Arc::new(CallService::new(
            Arc::clone(&registry),
            store.clone() as Arc<dyn Store>,
            Arc::new(UnsignedTokenIssuer),
            CallConfig::default(),
        ));
        Fixture {
            registry,
            store,
            service,
        }
    }

    pub(super) fn connect(registry: &ConnectionRegistry, user: &str) -> UnboundedReceiver<Outbound> {
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(user, handle).unwrap();
        rx
    }

    pub(super) fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push((*event).clone());
            }
        }
        events
    }

    fn group(invited: &[&str]) -> CreateCall {
        CreateCall {
            call_type: Some(CallType::Group),
            purpose: Some("prayer".into()),
            invited: invited.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_immediate_call() {
        let f = fixture();
        let created = f.service.create_call("alice", group(&[])).await.unwrap();

        assert_eq!(created.call.status, CallStatus::Active);
        assert_eq!(created.call.participants.len(), 1);
        let credentials = created.credentials.unwrap();
        assert_eq!(credentials.uid, 1);
        assert_eq!(credentials.channel_name, created.call.channel_name);
        assert_eq!(credentials.app_id, "vigil");
        assert!(f.store.call(&created.call.id).is_some());
        assert_eq!(f.service.active_count(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_call_activates_on_join() {
        let f = fixture();
        let request = CreateCall {
            scheduled_at: Some(now_millis() + 3_600_000),
            ..group(&["bob"])
        };
        let created = f.service.create_call("alice", request).await.unwrap();
        assert_eq!(created.call.status, CallStatus::Scheduled);
        assert!(created.credentials.is_none());
        assert!(created.call.participants.is_empty());

        let joined = f.service.join_call(&created.call.id, "bob").await.unwrap();
        assert_eq!(joined.call.status, CallStatus::Active);
        assert_eq!(joined.credentials.uid, 1);
    }

    #[tokio::test]
    async fn test_join_rules() {
        let f = fixture();
        let request = CreateCall {
            max_participants: Some(2),
            ..group(&["bob", "carol"])
        };
        let id = f.service.create_call("alice", request).await.unwrap().call.id;

        assert!(matches!(
            f.service.join_call(&id, "mallory").await,
            Err(RealtimeError::Forbidden(_))
        ));
        let first = f.service.join_call(&id, "bob").await.unwrap();
        assert!(matches!(
            f.service.join_call(&id, "carol").await,
            Err(RealtimeError::CallFull)
        ));

        // Rejoining keeps the uid and does not count against the limit.
        let again = f.service.join_call(&id, "bob").await.unwrap();
        assert_eq!(again.credentials.uid, first.credentials.uid);
        assert!(matches!(
            f.service.join_call("call_missing", "bob").await,
            Err(RealtimeError::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_last_leave_ends_call() {
        let f = fixture();
        let mut alice = connect(&f.registry, "alice");
        let id = f.service.create_call("alice", group(&[])).await.unwrap().call.id;
        f.service.join_call(&id, "bob").await.unwrap();
        drain(&mut alice);

        assert_eq!(f.service.leave_call(&id, "bob").await.unwrap(), None);
        assert!(matches!(
            drain(&mut alice).as_slice(),
            [ServerEvent::CallParticipantLeft { user_id, .. }] if user_id == "bob"
        ));

        assert_eq!(
            f.service.leave_call(&id, "alice").await.unwrap(),
            Some(CallEndReason::Completed)
        );
        assert!(matches!(
            f.service.join_call(&id, "alice").await,
            Err(RealtimeError::CallEnded)
        ));
        assert!(matches!(f.service.get_call(&id), Err(RealtimeError::CallEnded)));
        assert_eq!(f.store.call(&id).unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_one_on_one_ends_when_either_leaves() {
        let f = fixture();
        let mut bob = connect(&f.registry, "bob");
        let request = CreateCall {
            call_type: Some(CallType::OneOnOne),
            invited: vec!["bob".into()],
            ..Default::default()
        };
        let id = f.service.create_call("alice", request).await.unwrap().call.id;
        f.service.join_call(&id, "bob").await.unwrap();

        assert_eq!(
            f.service.leave_call(&id, "alice").await.unwrap(),
            Some(CallEndReason::HungUp)
        );
        let events = drain(&mut bob);
        assert!(matches!(
            events.last(),
            Some(ServerEvent::CallEnded { reason: CallEndReason::HungUp, user_id, .. }) if user_id == "alice"
        ));
        assert!(!f.service.is_busy("bob"));
    }

    #[tokio::test]
    async fn test_end_call_is_host_only() {
        let f = fixture();
        let mut bob = connect(&f.registry, "bob");
        let id = f.service.create_call("alice", group(&[])).await.unwrap().call.id;
        f.service.join_call(&id, "bob").await.unwrap();

        assert!(matches!(
            f.service.end_call(&id, "bob").await,
            Err(RealtimeError::Forbidden(_))
        ));
        f.service.end_call(&id, "alice").await.unwrap();

        assert!(matches!(
            drain(&mut bob).as_slice(),
            [ServerEvent::CallEnded { reason: CallEndReason::HostEnded, .. }]
        ));
        assert!(matches!(
            f.service.end_call(&id, "alice").await,
            Err(RealtimeError::CallEnded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_calls_are_forgotten_after_retention() {
        let f = fixture();
        let id = f.service.create_call("alice", group(&[])).await.unwrap().call.id;
        f.service.end_call(&id, "alice").await.unwrap();

        assert_eq!(f.service.prune_ended(), 0);
        assert!(matches!(f.service.get_call(&id), Err(RealtimeError::CallEnded)));

        tokio::time::sleep(CallConfig::default().ended_retention + Duration::from_secs(1)).await;
        assert_eq!(f.service.prune_ended(), 1);
        assert!(matches!(
            f.service.get_call(&id),
            Err(RealtimeError::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_screen_share_propagates_without_renegotiation() {
        let f = fixture();
        let mut one = connect(&f.registry, "one");
        let mut three = connect(&f.registry, "three");
        let id = f.service.create_call("one", group(&[])).await.unwrap().call.id;
        f.service.join_call(&id, "two").await.unwrap();
        f.service.join_call(&id, "three").await.unwrap();
        drain(&mut one);
        drain(&mut three);

        let patch = MediaStatePatch {
            is_screen_sharing: Some(true),
            ..Default::default()
        };
        let participant = f
            .service
            .update_participant_status(&id, "two", &patch)
            .unwrap();
        assert!(participant.is_screen_sharing);
        assert!(!participant.is_muted);

        let events = drain(&mut three);
        match events.as_slice() {
            [ServerEvent::CallParticipantUpdated { participant, .. }] => {
                assert_eq!(participant.user_id, "two");
                assert!(participant.is_screen_sharing);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(drain(&mut one).len(), 1);

        assert!(matches!(
            f.service.update_participant_status(&id, "four", &patch),
            Err(RealtimeError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_store_failure() {
        let f = fixture();
        f.store.set_fail_writes(true);

        assert!(matches!(
            f.service.create_call("alice", group(&[])).await,
            Err(RealtimeError::Persistence(_))
        ));
        assert_eq!(f.service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_group_calls() {
        let f = fixture();
        let mut alice = connect(&f.registry, "alice");
        let id = f.service.create_call("alice", group(&[])).await.unwrap().call.id;
        f.service.join_call(&id, "bob").await.unwrap();
        drain(&mut alice);

        f.service.disconnect("bob").await;

        assert!(matches!(
            drain(&mut alice).as_slice(),
            [ServerEvent::CallParticipantLeft { user_id, .. }] if user_id == "bob"
        ));
        let call = f.service.get_call(&id).unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert!(call
            .participants
            .iter()
            .any(|p| p.user_id == "bob" && !p.is_joined()));
    }
}
