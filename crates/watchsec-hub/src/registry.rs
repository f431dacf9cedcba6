//! Session registry: agents, their control channels and their rooms
//!
//! One [`Room`] per agent id holds the agent's live session (if connected)
//! and the viewers subscribed to it. Rooms live in a sharded map, so all
//! mutations for one agent are serialized on that agent's shard while other
//! agents proceed in parallel. Shard locks are only held for the map update:
//! outgoing messages are collected into [`Notices`] and queued after the
//! lock is released. Callers that keep per-agent state elsewhere can run
//! a hook under the same shard lock (see [`SessionRegistry::with_live_agent`])
//! to stay ordered against registration and unregistration.
//!
//! A room outlives its agent's connection as long as viewers remain
//! subscribed, so viewers keep their place across an agent reconnect.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use dashmap::DashMap;

use watchsec_core::time::current_time_millis;
use watchsec_core::RelayError;
use watchsec_protocol::{
    AgentId, ConnectionId, ControlCommand, HubToAgent, HubToViewer, TenantId, Transport,
};

use crate::auth::{RoomGate, ViewerIdentity};
use crate::channel::ChannelHandle;

/// The single live control connection of an agent
#[derive(Debug, Clone)]
pub struct AgentSession {
    /// Agent identifier
    pub agent_id: AgentId,
    /// Tenant owning the agent
    pub tenant: TenantId,
    /// Control channel to the agent
    pub control: ChannelHandle,
    /// Path the agent's stream currently takes
    pub transport: Transport,
    /// When the agent connected (ms since epoch)
    pub connected_at: u64,
}

/// A viewer's membership in one room
#[derive(Debug, Clone)]
pub struct ViewerSubscription {
    /// Channel to the viewer
    pub viewer: ChannelHandle,
    /// Who the viewer is
    pub identity: ViewerIdentity,
    /// When the viewer joined (ms since epoch)
    pub joined_at: u64,
    /// Whether the viewer receives frames over a direct peer path
    pub direct: bool,
}

#[derive(Debug, Default)]
struct Room {
    session: Option<AgentSession>,
    viewers: HashMap<ConnectionId, ViewerSubscription>,
}

impl Room {
    fn is_empty(&self) -> bool {
        self.session.is_none() && self.viewers.is_empty()
    }

    fn transport(&self) -> Transport {
        self.session
            .as_ref()
            .map(|s| s.transport)
            .unwrap_or_default()
    }

    /// Re-derive the transport of an active stream from room membership.
    ///
    /// Relayed while any member lacks a direct path, peer-to-peer once
    /// every member has one. A stream that is not active stays `None`.
    fn refresh_transport(&mut self) -> Transport {
        let direct_only = !self.viewers.is_empty() && self.viewers.values().all(|v| v.direct);
        match self.session.as_mut() {
            Some(session) if session.transport != Transport::None => {
                session.transport = if direct_only {
                    Transport::PeerToPeer
                } else {
                    Transport::Relayed
                };
                session.transport
            }
            Some(session) => session.transport,
            None => Transport::None,
        }
    }

    fn transport_notices(&self, agent_id: &AgentId, transport: Transport, notices: &mut Notices) {
        if let Some(session) = &self.session {
            notices.agent(&session.control, HubToAgent::TransportSelected { transport });
        }
        for sub in self.viewers.values() {
            notices.viewer(
                &sub.viewer,
                HubToViewer::TransportChanged {
                    agent_id: agent_id.clone(),
                    transport,
                },
            );
        }
    }
}

/// Messages collected under a shard lock, sent after it is released
#[derive(Default)]
struct Notices {
    to_agents: Vec<(ChannelHandle, HubToAgent)>,
    to_viewers: Vec<(ChannelHandle, HubToViewer)>,
}

impl Notices {
    fn agent(&mut self, handle: &ChannelHandle, msg: HubToAgent) {
        self.to_agents.push((handle.clone(), msg));
    }

    fn viewer(&mut self, handle: &ChannelHandle, msg: HubToViewer) {
        self.to_viewers.push((handle.clone(), msg));
    }

    fn deliver(self) {
        for (handle, msg) in self.to_agents {
            if let Err(e) = handle.send_message(&msg) {
                tracing::debug!("Dropped notice to agent connection {}: {}", handle.id(), e);
            }
        }
        for (handle, msg) in self.to_viewers {
            if let Err(e) = handle.send_message(&msg) {
                tracing::debug!("Dropped notice to viewer connection {}: {}", handle.id(), e);
            }
        }
    }
}

/// Result of fanning one frame out to a room
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Viewers the frame was queued for
    pub delivered: usize,
    /// Viewers removed from the room because their queue was full or closed
    pub dropped: Vec<ConnectionId>,
}

/// What a closed connection turned out to be
#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    /// The live control channel of an agent
    Agent(AgentId),
    /// An agent connection already replaced by a newer one
    Superseded(AgentId),
    /// A viewer, with the rooms it was removed from
    Viewer(Vec<AgentId>),
    /// Nothing registered under this connection
    Unknown,
}

/// Registry of agent sessions and viewer rooms
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Rooms indexed by agent ID
    rooms: DashMap<AgentId, Room>,
    /// Agent control connections
    agent_conns: DashMap<ConnectionId, AgentId>,
    /// Rooms each viewer connection has joined
    viewer_rooms: DashMap<ConnectionId, HashSet<AgentId>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent's control channel.
    ///
    /// A previous connection for the same agent is closed (last writer
    /// wins). Viewers still in the room are told the agent is back; those
    /// no longer authorized for the agent's tenant are removed.
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        tenant: TenantId,
        control: ChannelHandle,
    ) -> AgentSession {
        self.register_agent_with(agent_id, tenant, control, || ())
    }

    /// [`register_agent`](Self::register_agent), running `on_swap` while
    /// the room is still locked by the new session
    pub fn register_agent_with(
        &self,
        agent_id: AgentId,
        tenant: TenantId,
        control: ChannelHandle,
        on_swap: impl FnOnce(),
    ) -> AgentSession {
        let session = AgentSession {
            agent_id: agent_id.clone(),
            tenant: tenant.clone(),
            control: control.clone(),
            transport: Transport::None,
            connected_at: current_time_millis(),
        };

        let mut notices = Notices::default();
        let mut revoked = Vec::new();
        let evicted = {
            let mut room = self.rooms.entry(agent_id.clone()).or_default();
            let evicted = room.session.replace(session.clone());
            on_swap();

            room.viewers.retain(|_, sub| {
                let allowed = RoomGate::authorize(&sub.identity, &agent_id, &tenant).is_ok();
                if !allowed {
                    revoked.push(sub.viewer.clone());
                }
                allowed
            });
            for sub in room.viewers.values_mut() {
                sub.direct = false;
                notices.viewer(
                    &sub.viewer,
                    HubToViewer::AgentOnline {
                        agent_id: agent_id.clone(),
                    },
                );
            }
            evicted
        };

        self.agent_conns.insert(control.id(), agent_id.clone());

        if let Some(previous) = evicted {
            self.agent_conns.remove(&previous.control.id());
            previous.control.close();
            tracing::info!(
                "Agent {} reconnected on {}, evicted previous connection {}",
                agent_id,
                control.id(),
                previous.control.id()
            );
        }

        for viewer in revoked {
            self.forget_viewer_room(viewer.id(), &agent_id);
            notices.viewer(
                &viewer,
                HubToViewer::Left {
                    agent_id: agent_id.clone(),
                },
            );
        }

        notices.deliver();
        tracing::info!(
            agent = %agent_id,
            tenant = %tenant,
            conn = %control.id(),
            "Agent registered"
        );
        session
    }

    /// Subscribe a viewer to an agent's room.
    ///
    /// Returns the agent's current transport. Fails with
    /// `TargetUnavailable` if the agent is not connected and with
    /// `Authorization` if the viewer's tenant does not own the agent; in
    /// both cases the room is left unchanged.
    pub fn subscribe_viewer(
        &self,
        agent_id: &AgentId,
        identity: &ViewerIdentity,
        viewer: ChannelHandle,
    ) -> Result<Transport, RelayError> {
        let viewer_id = viewer.id();
        let mut notices = Notices::default();

        let transport = {
            let mut room = self
                .rooms
                .get_mut(agent_id)
                .ok_or_else(|| RelayError::TargetUnavailable(agent_id.clone()))?;
            let tenant = room
                .session
                .as_ref()
                .map(|s| s.tenant.clone())
                .ok_or_else(|| RelayError::TargetUnavailable(agent_id.clone()))?;

            RoomGate::authorize(identity, agent_id, &tenant)?;

            let before = room.transport();
            room.viewers
                .entry(viewer_id)
                .or_insert_with(|| ViewerSubscription {
                    viewer,
                    identity: identity.clone(),
                    joined_at: current_time_millis(),
                    direct: false,
                });
            let after = room.refresh_transport();
            if after != before {
                room.transport_notices(agent_id, after, &mut notices);
            }
            after
        };

        self.viewer_rooms
            .entry(viewer_id)
            .or_default()
            .insert(agent_id.clone());

        notices.deliver();
        tracing::info!(
            agent = %agent_id,
            viewer = %identity.name,
            conn = %viewer_id,
            "Viewer subscribed"
        );
        Ok(transport)
    }

    /// Remove a viewer from an agent's room. Idempotent.
    ///
    /// Returns whether the viewer was subscribed.
    pub fn unsubscribe_viewer(&self, agent_id: &AgentId, viewer_id: ConnectionId) -> bool {
        let mut notices = Notices::default();
        let removed = self
            .remove_subscription(agent_id, viewer_id, &mut notices)
            .is_some();
        if removed {
            self.forget_viewer_room(viewer_id, agent_id);
            tracing::info!(agent = %agent_id, conn = %viewer_id, "Viewer unsubscribed");
        }
        notices.deliver();
        removed
    }

    /// Fan a frame out to every relayed subscriber of the agent's room.
    ///
    /// Never blocks: a viewer whose queue is full (or closed) is removed
    /// from the room instead of holding up the others.
    pub fn relay_frame(&self, agent_id: &AgentId, frame: Bytes) -> FanOut {
        let targets: Vec<ChannelHandle> = match self.rooms.get(agent_id) {
            Some(room) => room
                .viewers
                .values()
                .filter(|sub| !sub.direct)
                .map(|sub| sub.viewer.clone())
                .collect(),
            None => return FanOut::default(),
        };

        let mut fan_out = FanOut::default();
        for viewer in targets {
            match viewer.try_send_frame(frame.clone()) {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    tracing::debug!("Frame for {} not queued: {}", viewer.id(), e);
                    fan_out.dropped.push(viewer.id());
                }
            }
        }

        if !fan_out.dropped.is_empty() {
            let mut notices = Notices::default();
            for viewer_id in &fan_out.dropped {
                if let Some(sub) = self.remove_subscription(agent_id, *viewer_id, &mut notices) {
                    self.forget_viewer_room(*viewer_id, agent_id);
                    tracing::warn!(
                        agent = %agent_id,
                        viewer = %sub.identity.name,
                        conn = %viewer_id,
                        "Removed slow viewer from room"
                    );
                    notices.viewer(
                        &sub.viewer,
                        HubToViewer::Left {
                            agent_id: agent_id.clone(),
                        },
                    );
                }
            }
            notices.deliver();
        }

        fan_out
    }

    /// Forward a viewer's command to the agent.
    ///
    /// The viewer must still be subscribed and authorized for the agent.
    /// Returns `TargetUnavailable` (to be absorbed by the caller) when the
    /// agent has disconnected.
    pub fn relay_command(
        &self,
        agent_id: &AgentId,
        viewer_id: ConnectionId,
        identity: &ViewerIdentity,
        command: ControlCommand,
    ) -> Result<(), RelayError> {
        let not_subscribed = || RelayError::Authorization {
            agent_id: agent_id.clone(),
            tenant: identity.tenant.clone(),
        };

        let control = {
            let room = self.rooms.get(agent_id).ok_or_else(not_subscribed)?;
            let sub = room.viewers.get(&viewer_id).ok_or_else(not_subscribed)?;
            let session = room
                .session
                .as_ref()
                .ok_or_else(|| RelayError::TargetUnavailable(agent_id.clone()))?;
            RoomGate::authorize(&sub.identity, agent_id, &session.tenant)?;
            session.control.clone()
        };

        tracing::debug!(
            agent = %agent_id,
            conn = %viewer_id,
            command = command.kind(),
            "Relaying command"
        );
        control.send_message(&HubToAgent::Command { viewer_id, command })
    }

    /// Record the outcome of a peer negotiation between an agent and a viewer.
    ///
    /// A failure also covers a direct path that dropped after connecting: the
    /// viewer goes back to relay. The first settled negotiation activates the
    /// agent's stream. Returns the
    /// agent's transport afterwards, or `None` if the agent is not connected.
    pub fn settle_peer(
        &self,
        agent_id: &AgentId,
        viewer_id: ConnectionId,
        connected: bool,
    ) -> Option<Transport> {
        let mut notices = Notices::default();
        let transport = {
            let mut room = self.rooms.get_mut(agent_id)?;
            let before = room.transport();
            if let Some(sub) = room.viewers.get_mut(&viewer_id) {
                sub.direct = connected;
            }
            let session = room.session.as_mut()?;
            if session.transport == Transport::None {
                session.transport = Transport::Relayed;
            }
            let after = room.refresh_transport();
            if after != before {
                room.transport_notices(agent_id, after, &mut notices);
            }
            after
        };

        notices.deliver();
        tracing::info!(
            agent = %agent_id,
            conn = %viewer_id,
            connected,
            %transport,
            "Peer negotiation settled"
        );
        Some(transport)
    }

    /// Force an agent's transport, notifying agent and room on change.
    ///
    /// Setting `None` ends the stream and clears every direct path.
    pub fn set_transport(&self, agent_id: &AgentId, transport: Transport) -> bool {
        let mut notices = Notices::default();
        let changed = {
            let Some(mut room) = self.rooms.get_mut(agent_id) else {
                return false;
            };
            if transport == Transport::None {
                for sub in room.viewers.values_mut() {
                    sub.direct = false;
                }
            }
            let Some(session) = room.session.as_mut() else {
                return false;
            };
            let changed = session.transport != transport;
            session.transport = transport;
            if changed {
                room.transport_notices(agent_id, transport, &mut notices);
            }
            changed
        };
        notices.deliver();
        changed
    }

    /// Remove whatever was registered under a closed connection. Idempotent.
    pub fn unregister(&self, conn: ConnectionId) -> Departure {
        self.unregister_with(conn, |_| ())
    }

    /// [`unregister`](Self::unregister), running `on_offline` under the
    /// room lock when the closed connection was an agent's live session
    pub fn unregister_with(&self, conn: ConnectionId, on_offline: impl FnOnce(&AgentId)) -> Departure {
        if let Some((_, agent_id)) = self.agent_conns.remove(&conn) {
            let mut notices = Notices::default();
            let mut was_current = false;
            let mut drop_room = false;

            if let Some(mut room) = self.rooms.get_mut(&agent_id) {
                if room.session.as_ref().map(|s| s.control.id()) == Some(conn) {
                    room.session = None;
                    was_current = true;
                    on_offline(&agent_id);
                    for sub in room.viewers.values_mut() {
                        sub.direct = false;
                        notices.viewer(
                            &sub.viewer,
                            HubToViewer::AgentOffline {
                                agent_id: agent_id.clone(),
                            },
                        );
                    }
                }
                drop_room = room.is_empty();
            }

            if drop_room {
                self.rooms.remove_if(&agent_id, |_, room| room.is_empty());
            }
            notices.deliver();

            if was_current {
                tracing::info!(agent = %agent_id, conn = %conn, "Agent unregistered");
                return Departure::Agent(agent_id);
            }
            tracing::debug!(agent = %agent_id, conn = %conn, "Superseded agent connection closed");
            return Departure::Superseded(agent_id);
        }

        if let Some((_, agents)) = self.viewer_rooms.remove(&conn) {
            let mut notices = Notices::default();
            for agent_id in &agents {
                self.remove_subscription(agent_id, conn, &mut notices);
            }
            notices.deliver();
            tracing::info!(conn = %conn, rooms = agents.len(), "Viewer unregistered");
            return Departure::Viewer(agents.into_iter().collect());
        }

        Departure::Unknown
    }

    /// Run `f` with the agent's live session while holding its room.
    ///
    /// Registration and unregistration of the agent wait for `f`, so state
    /// created inside it cannot outlive the session unnoticed. `f` must
    /// not call back into the registry.
    pub fn with_live_agent<R>(
        &self,
        agent_id: &AgentId,
        f: impl FnOnce(&AgentSession) -> R,
    ) -> Option<R> {
        let room = self.rooms.get(agent_id)?;
        room.session.as_ref().map(f)
    }

    /// Control channel of a connected agent
    pub fn agent_handle(&self, agent_id: &AgentId) -> Option<ChannelHandle> {
        self.rooms
            .get(agent_id)
            .and_then(|room| room.session.as_ref().map(|s| s.control.clone()))
    }

    /// Channel of a viewer subscribed to an agent's room
    pub fn viewer_handle(&self, agent_id: &AgentId, viewer_id: ConnectionId) -> Option<ChannelHandle> {
        self.rooms
            .get(agent_id)
            .and_then(|room| room.viewers.get(&viewer_id).map(|s| s.viewer.clone()))
    }

    /// Whether a viewer is subscribed to an agent's room
    pub fn is_subscribed(&self, agent_id: &AgentId, viewer_id: ConnectionId) -> bool {
        self.rooms
            .get(agent_id)
            .map(|room| room.viewers.contains_key(&viewer_id))
            .unwrap_or(false)
    }

    /// Whether the agent has a live session
    pub fn is_live(&self, agent_id: &AgentId) -> bool {
        self.rooms
            .get(agent_id)
            .map(|room| room.session.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of an agent's session
    pub fn session(&self, agent_id: &AgentId) -> Option<AgentSession> {
        self.rooms.get(agent_id).and_then(|room| room.session.clone())
    }

    /// Current transport of an agent's stream
    pub fn transport(&self, agent_id: &AgentId) -> Transport {
        self.rooms
            .get(agent_id)
            .map(|room| room.transport())
            .unwrap_or_default()
    }

    /// Connections currently in an agent's room
    pub fn room_members(&self, agent_id: &AgentId) -> Vec<ConnectionId> {
        let mut members: Vec<_> = self
            .rooms
            .get(agent_id)
            .map(|room| room.viewers.keys().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of connected agents
    pub fn agent_count(&self) -> usize {
        self.agent_conns.len()
    }

    /// Number of viewers subscribed to at least one room
    pub fn viewer_count(&self) -> usize {
        self.viewer_rooms.len()
    }

    fn remove_subscription(
        &self,
        agent_id: &AgentId,
        viewer_id: ConnectionId,
        notices: &mut Notices,
    ) -> Option<ViewerSubscription> {
        let (sub, drop_room) = {
            let mut room = self.rooms.get_mut(agent_id)?;
            let sub = room.viewers.remove(&viewer_id)?;

            let before = room.transport();
            if let Some(control) = room.session.as_ref().map(|s| s.control.clone()) {
                notices.agent(&control, HubToAgent::ViewerLeft { viewer_id });
                if room.viewers.is_empty() {
                    notices.agent(&control, HubToAgent::StopSession);
                    if let Some(session) = room.session.as_mut() {
                        session.transport = Transport::None;
                    }
                } else {
                    let after = room.refresh_transport();
                    if after != before {
                        room.transport_notices(agent_id, after, notices);
                    }
                }
            }
            (sub, room.is_empty())
        };

        if drop_room {
            self.rooms.remove_if(agent_id, |_, room| room.is_empty());
        }
        Some(sub)
    }

    fn forget_viewer_room(&self, viewer_id: ConnectionId, agent_id: &AgentId) {
        if let Some(mut rooms) = self.viewer_rooms.get_mut(&viewer_id) {
            rooms.remove(agent_id);
        }
        self.viewer_rooms.remove_if(&viewer_id, |_, rooms| rooms.is_empty());
    }
}
