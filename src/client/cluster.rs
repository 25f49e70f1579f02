//! Cluster membership and leadership maintenance.
//!
//! The leader is the one reported by the responsive member with the highest
//! raft term. Leadership changes are refused for learners and unresponsive
//! members, and need a reachable leader plus at least one transfer candidate.

use super::Client;
use crate::backend::{EndpointStatus, Member};
use crate::core::error::{KvError, KvResult};

/// Status of one member as probed through its first client URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberStatus {
    pub is_leader: bool,
    pub is_responsive: bool,
    /// Probe failure, when not responsive.
    pub response_error: Option<String>,
    pub protocol_version: String,
    pub db_size: i64,
    pub db_size_in_use: i64,
    pub raft_index: u64,
    pub raft_term: u64,
    pub raft_applied_index: u64,
}

impl MemberStatus {
    fn unresponsive(error: impl Into<String>) -> Self {
        Self {
            response_error: Some(error.into()),
            ..Self::default()
        }
    }

    fn from_endpoint(status: &EndpointStatus) -> Self {
        Self {
            is_leader: false,
            is_responsive: true,
            response_error: None,
            protocol_version: status.version.clone(),
            db_size: status.db_size,
            db_size_in_use: status.db_size_in_use,
            raft_index: status.raft_index,
            raft_term: status.raft_term,
            raft_applied_index: status.raft_applied_index,
        }
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
    /// Present when status was requested.
    pub status: Option<MemberStatus>,
}

impl ClusterMember {
    fn is_leader(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.is_leader)
    }

    fn is_responsive(&self) -> bool {
        self.status.as_ref().map_or(false, |s| s.is_responsive)
    }
}

impl From<Member> for ClusterMember {
    fn from(member: Member) -> Self {
        Self {
            id: member.id,
            name: member.name,
            peer_urls: member.peer_urls,
            client_urls: member.client_urls,
            is_learner: member.is_learner,
            status: None,
        }
    }
}

/// Member list with the header of the answering member.
#[derive(Debug, Clone)]
pub struct ClusterMembers {
    pub cluster_id: u64,
    pub member_id: u64,
    pub revision: i64,
    pub raft_term: u64,
    pub members: Vec<ClusterMember>,
}

impl ClusterMembers {
    /// The member flagged as leader, if status was fetched and one was found.
    pub fn leader(&self) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.is_leader())
    }
}

impl Client {
    /// List members, probing each one's status when `with_status` is set.
    ///
    /// A failed probe marks that member unresponsive instead of failing the
    /// whole call.
    pub async fn get_members(&self, with_status: bool) -> KvResult<ClusterMembers> {
        let list = self.call("member_list", |store| store.member_list()).await?;
        let mut members = ClusterMembers {
            cluster_id: list.cluster_id,
            member_id: list.member_id,
            revision: list.revision,
            raft_term: list.raft_term,
            members: list.members.into_iter().map(ClusterMember::from).collect(),
        };
        if !with_status {
            return Ok(members);
        }

        let mut leader_id = 0;
        let mut raft_term = 0;
        for member in members.members.iter_mut() {
            let Some(endpoint) = member.client_urls.first().cloned() else {
                member.status = Some(MemberStatus::unresponsive("member has no client url"));
                continue;
            };
            let probe = self
                .call("endpoint_status", |store| store.endpoint_status(&endpoint))
                .await;
            match probe {
                Ok(status) => {
                    member.is_learner = member.is_learner || status.is_learner;
                    member.status = Some(MemberStatus::from_endpoint(&status));
                    if status.raft_term >= raft_term {
                        raft_term = status.raft_term;
                        leader_id = status.leader;
                    }
                }
                Err(err) => {
                    tracing::warn!(member = %member.name, error = %err, "member status probe failed");
                    member.status = Some(MemberStatus::unresponsive(err.to_string()));
                }
            }
        }

        for member in members.members.iter_mut() {
            if member.id == leader_id {
                if let Some(status) = member.status.as_mut() {
                    status.is_leader = true;
                }
            }
        }
        Ok(members)
    }

    /// Make the member called `name` leader (`is_leader == true`) or move
    /// leadership away from it. No-op if it already has the requested status.
    pub async fn set_leader_status(&self, name: &str, is_leader: bool) -> KvResult<()> {
        let members = self.get_members(true).await?;
        let target = members
            .members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| KvError::cluster(format!("no member named {}", name)))?;

        if target.is_learner {
            return Err(KvError::cluster(format!(
                "cannot change leader status of node {} as it is a learner",
                name
            )));
        }
        if !target.is_responsive() {
            return Err(KvError::cluster(format!(
                "cannot change leader status of node {} as it is not responsive",
                name
            )));
        }
        if target.is_leader() == is_leader {
            return Ok(());
        }

        let candidates: Vec<u64> = if is_leader {
            vec![target.id]
        } else {
            transfer_candidates(&members)
        };
        self.transfer_leadership(&members, &candidates).await
    }

    /// Move leadership to another eligible member.
    pub async fn change_leader(&self) -> KvResult<()> {
        let members = self.get_members(true).await?;
        let candidates = transfer_candidates(&members);
        self.transfer_leadership(&members, &candidates).await
    }

    async fn transfer_leadership(&self, members: &ClusterMembers, candidates: &[u64]) -> KvResult<()> {
        if members.leader().is_none() {
            return Err(KvError::cluster(
                "cannot change leader status as it requires a pre-existing leader and no such node can be reached",
            ));
        }
        let Some(&transferee) = candidates.first() else {
            return Err(KvError::cluster(
                "cannot change leader status as no transfer candidate exists",
            ));
        };
        tracing::info!(transferee, "transferring leadership");
        self.call("move_leader", |store| store.move_leader(transferee))
            .await
    }
}

/// Responsive voters that are not the current leader.
fn transfer_candidates(members: &ClusterMembers) -> Vec<u64> {
    members
        .members
        .iter()
        .filter(|m| !m.is_leader() && !m.is_learner && m.is_responsive())
        .map(|m| m.id)
        .collect()
}
