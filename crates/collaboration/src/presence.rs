/// Participant registry
/// Who is connected to each workspace and how to reach them
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::{ClientId, CollaborationError, ParticipantInfo, Result, ServerMessage, WorkspaceId};

struct Participant {
    info: ParticipantInfo,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Context object shared by the gateway and the transport
#[derive(Default)]
pub struct ParticipantRegistry {
    workspaces: RwLock<HashMap<WorkspaceId, HashMap<ClientId, Participant>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client in a workspace and tell the others
    pub async fn join(
        &self,
        workspace_id: &WorkspaceId,
        client_id: ClientId,
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> ParticipantInfo {
        let info = ParticipantInfo {
            client_id,
            name: name.into(),
            last_seen: chrono::Utc::now(),
        };

        let mut workspaces = self.workspaces.write().await;
        let members = workspaces.entry(workspace_id.clone()).or_default();
        let joined = ServerMessage::ParticipantJoined {
            workspace_id: workspace_id.clone(),
            participant: info.clone(),
        };
        for (other, participant) in members.iter() {
            if *other != client_id {
                let _ = participant.tx.send(joined.clone());
            }
        }
        members.insert(
            client_id,
            Participant {
                info: info.clone(),
                tx,
            },
        );

        tracing::info!("{} ({}) joined {}", info.name, client_id, workspace_id);
        info
    }

    /// Remove a client from a workspace; false if it was not there
    pub async fn leave(&self, workspace_id: &WorkspaceId, client_id: &ClientId) -> bool {
        let mut workspaces = self.workspaces.write().await;
        let Some(members) = workspaces.get_mut(workspace_id) else {
            return false;
        };
        if members.remove(client_id).is_none() {
            return false;
        }

        let left = ServerMessage::ParticipantLeft {
            workspace_id: workspace_id.clone(),
            client_id: *client_id,
        };
        for participant in members.values() {
            let _ = participant.tx.send(left.clone());
        }
        if members.is_empty() {
            workspaces.remove(workspace_id);
        }

        tracing::info!("{} left {}", client_id, workspace_id);
        true
    }

    /// Drop a client from every workspace, e.g. when its connection closes
    pub async fn disconnect(&self, client_id: &ClientId) -> Vec<WorkspaceId> {
        let joined: Vec<WorkspaceId> = {
            let workspaces = self.workspaces.read().await;
            workspaces
                .iter()
                .filter(|(_, members)| members.contains_key(client_id))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for workspace_id in &joined {
            self.leave(workspace_id, client_id).await;
        }
        joined
    }

    pub async fn is_member(&self, workspace_id: &WorkspaceId, client_id: &ClientId) -> bool {
        let workspaces = self.workspaces.read().await;
        workspaces
            .get(workspace_id)
            .is_some_and(|members| members.contains_key(client_id))
    }

    pub async fn keep_alive(&self, workspace_id: &WorkspaceId, client_id: &ClientId) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        let participant = workspaces
            .get_mut(workspace_id)
            .and_then(|members| members.get_mut(client_id))
            .ok_or_else(|| {
                CollaborationError::SessionNotFound(format!("{} in {}", client_id, workspace_id))
            })?;
        participant.info.last_seen = chrono::Utc::now();
        Ok(())
    }

    pub async fn participants(&self, workspace_id: &WorkspaceId) -> Vec<ParticipantInfo> {
        let workspaces = self.workspaces.read().await;
        let mut list: Vec<ParticipantInfo> = workspaces
            .get(workspace_id)
            .map(|members| members.values().map(|p| p.info.clone()).collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.client_id.cmp(&b.client_id)));
        list
    }

    /// Deliver a message to one participant
    pub async fn send_to(
        &self,
        workspace_id: &WorkspaceId,
        client_id: &ClientId,
        message: ServerMessage,
    ) -> Result<()> {
        let workspaces = self.workspaces.read().await;
        let participant = workspaces
            .get(workspace_id)
            .and_then(|members| members.get(client_id))
            .ok_or_else(|| {
                CollaborationError::SessionNotFound(format!("{} in {}", client_id, workspace_id))
            })?;
        participant
            .tx
            .send(message)
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))
    }

    /// Deliver a message to every participant except `exclude`.
    ///
    /// Closed channels are skipped; the transport cleans them up on
    /// disconnect. Returns how many participants received the message.
    pub async fn broadcast(
        &self,
        workspace_id: &WorkspaceId,
        message: ServerMessage,
        exclude: Option<ClientId>,
    ) -> usize {
        let workspaces = self.workspaces.read().await;
        let Some(members) = workspaces.get(workspace_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (client_id, participant) in members {
            if exclude == Some(*client_id) {
                continue;
            }
            match participant.tx.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!("dropping message for closed client {}", client_id),
            }
        }
        delivered
    }

    /// Remove participants not heard from within `timeout`
    pub async fn expire_idle(&self, timeout: Duration) -> Vec<(WorkspaceId, ClientId)> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::milliseconds(timeout.as_millis().min(i64::MAX as u128) as i64);
        let expired: Vec<(WorkspaceId, ClientId)> = {
            let workspaces = self.workspaces.read().await;
            workspaces
                .iter()
                .flat_map(|(workspace_id, members)| {
                    members
                        .values()
                        .filter(|p| p.info.last_seen < cutoff)
                        .map(move |p| (workspace_id.clone(), p.info.client_id))
                })
                .collect()
        };

        for (workspace_id, client_id) in &expired {
            tracing::warn!("{} timed out in {}", client_id, workspace_id);
            self.leave(workspace_id, client_id).await;
        }
        expired
    }
}
