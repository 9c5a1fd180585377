use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::hub::Hub;
use crate::store::Store;
use crate::types::*;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEntry {
    pub friend: PublicProfile,
    pub online: bool,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    pub id: Uuid,
    pub user: PublicProfile,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRequests {
    pub incoming: Vec<RequestEntry>,
    pub outgoing: Vec<RequestEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "status")]
pub enum RequestOutcome {
    Requested { request_id: Uuid },
    Accepted { request_id: Uuid },
}

fn profile(store: &Store, id: Uuid) -> AppResult<PublicProfile> {
    store
        .user(id)
        .map(|u| PublicProfile::from(&u))
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// Send a friend request; a mirrored pending request is accepted instead.
pub fn request(store: &Store, hub: &Hub, from: Uuid, to: Uuid) -> AppResult<RequestOutcome> {
    if from == to {
        return Err(AppError::bad_request("Cannot befriend yourself"));
    }
    let target = profile(store, to)?;

    if let Some(existing) = store.friendship_between(from, to) {
        return match existing.status {
            FriendStatus::Accepted => Err(AppError::conflict("Already friends")),
            FriendStatus::Pending if existing.requester == from => {
                Err(AppError::conflict("Friend request already sent"))
            }
            FriendStatus::Pending => {
                accept(store, hub, existing.id, from)?;
                Ok(RequestOutcome::Accepted { request_id: existing.id })
            }
        };
    }

    let friendship = Friendship {
        id: Uuid::new_v4(),
        requester: from,
        addressee: to,
        status: FriendStatus::Pending,
        created_at: Utc::now(),
    };
    let request_id = friendship.id;
    store.insert_friendship(friendship);

    hub.send(target.id, ServerMsg::FriendRequest {
        request_id,
        from: profile(store, from)?,
    });
    Ok(RequestOutcome::Requested { request_id })
}

/// Only the addressee may accept.
pub fn accept(store: &Store, hub: &Hub, request_id: Uuid, by: Uuid) -> AppResult<()> {
    let friendship = pending_addressed_to(store, request_id, by)?;
    store.update_friendship(request_id, |f| f.status = FriendStatus::Accepted);

    hub.send(friendship.requester, ServerMsg::FriendAccepted {
        friend: profile(store, by)?,
    });
    Ok(())
}

pub fn decline(store: &Store, request_id: Uuid, by: Uuid) -> AppResult<()> {
    pending_addressed_to(store, request_id, by)?;
    store.remove_friendship(request_id);
    Ok(())
}

fn pending_addressed_to(store: &Store, request_id: Uuid, by: Uuid) -> AppResult<Friendship> {
    let friendship = store
        .friendship(request_id)
        .filter(|f| f.status == FriendStatus::Pending)
        .ok_or_else(|| AppError::not_found("Friend request not found"))?;
    if friendship.addressee != by {
        return Err(AppError::forbidden("This request is not addressed to you"));
    }
    Ok(friendship)
}

pub fn remove(store: &Store, me: Uuid, friend: Uuid) -> AppResult<()> {
    let friendship = store
        .friendship_between(me, friend)
        .filter(|f| f.status == FriendStatus::Accepted)
        .ok_or_else(|| AppError::not_found("Not friends"))?;
    store.remove_friendship(friendship.id);
    Ok(())
}

pub fn list(store: &Store, hub: &Hub, me: Uuid) -> Vec<FriendEntry> {
    store
        .friendships_of(me, FriendStatus::Accepted)
        .into_iter()
        .filter_map(|f| {
            let other = f.other(me);
            let friend = store.user(other)?;
            Some(FriendEntry {
                friend: PublicProfile::from(&friend),
                online: hub.is_online(other),
                since: f.created_at,
            })
        })
        .collect()
}

pub fn pending(store: &Store, me: Uuid) -> PendingRequests {
    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for f in store.friendships_of(me, FriendStatus::Pending) {
        let Some(other) = store.user(f.other(me)) else {
            continue;
        };
        let entry = RequestEntry {
            id: f.id,
            user: PublicProfile::from(&other),
            created_at: f.created_at,
        };
        if f.addressee == me {
            incoming.push(entry);
        } else {
            outgoing.push(entry);
        }
    }
    PendingRequests { incoming, outgoing }
}
