//! Group registry: the in-process cache of every group's state and the
//! entry point that turns accepted group events into state mutations and
//! storage commands.

pub mod group;

use crate::error::Error;
use crate::event::{unix_now, Event};
use crate::filter::Filter;
use crate::relay_store::RelayStore;
use crate::store::StoreCommand;
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
pub use group::{
    is_moderation_kind, is_relay_state_kind, required_role, Group, GroupMember, GroupMetadata,
    GroupRole, Invite, KIND_GROUP_ADMINS, KIND_GROUP_CREATE, KIND_GROUP_CREATE_INVITE,
    KIND_GROUP_DELETE, KIND_GROUP_DELETE_EVENT, KIND_GROUP_EDIT_METADATA, KIND_GROUP_JOIN_REQUEST,
    KIND_GROUP_LEAVE_REQUEST, KIND_GROUP_MEMBERS, KIND_GROUP_METADATA, KIND_GROUP_PUT_USER,
    KIND_GROUP_REMOVE_USER, KIND_GROUP_ROLES, RELAY_STATE_KINDS,
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Groups {
    groups: DashMap<String, Group>,
    relay_pubkey: String,
}

impl Groups {
    pub fn new(relay_pubkey: String) -> Self {
        Self {
            groups: DashMap::new(),
            relay_pubkey,
        }
    }

    /// Rebuilds every group from the relay-authored snapshots and invite
    /// records already in the store, then replays timeline references.
    pub async fn load_groups(store: Arc<RelayStore>, relay_pubkey: String) -> Result<Self, Error> {
        let groups = Self::new(relay_pubkey);

        // Unclamped queries: startup reload must see every snapshot.
        let metadata_events = store
            .pipeline()
            .query_events(&[Filter::new().kinds([KIND_GROUP_METADATA])])
            .await?;
        for event in &metadata_events {
            if let Some(id) = event.tag_value("d") {
                let mut group = Group::new_with_id(id.to_string(), event.created_at);
                group.load_metadata_from_event(event);
                groups.groups.insert(id.to_string(), group);
            }
        }

        let membership_events = store
            .pipeline()
            .query_events(&[Filter::new().kinds([KIND_GROUP_ADMINS, KIND_GROUP_MEMBERS])])
            .await?;
        for event in &membership_events {
            if let Some(mut group) = event.tag_value("d").and_then(|id| groups.groups.get_mut(id)) {
                group.load_members_from_event(event);
            }
        }

        let invite_events = store
            .pipeline()
            .query_events(&[Filter::new().kinds([KIND_GROUP_CREATE_INVITE])])
            .await?;
        for event in &invite_events {
            if let Some(mut group) = event.tag_value("h").and_then(|id| groups.groups.get_mut(id)) {
                group.load_invite_from_event(event);
            }
        }

        let group_ids: Vec<String> = groups.groups.iter().map(|entry| entry.id.clone()).collect();
        for group_id in group_ids {
            let timeline = store
                .pipeline()
                .query_events(&[Filter::new().tag("h", [group_id.clone()])])
                .await?;
            if let Some(mut group) = groups.groups.get_mut(&group_id) {
                for event in &timeline {
                    group.record_timeline_ref(&event.id);
                }
            }
        }

        info!("loaded {} groups from the store", groups.groups.len());
        Ok(groups)
    }

    pub fn relay_pubkey(&self) -> &str {
        &self.relay_pubkey
    }

    pub fn get_group(&self, group_id: &str) -> Option<Ref<'_, String, Group>> {
        self.groups.get(group_id)
    }

    pub fn get_group_mut(&self, group_id: &str) -> Option<RefMut<'_, String, Group>> {
        self.groups.get_mut(group_id)
    }

    pub fn iter(&self) -> dashmap::iter::Iter<'_, String, Group> {
        self.groups.iter()
    }

    pub fn find_group_from_event(&self, event: &Event) -> Option<Ref<'_, String, Group>> {
        Group::extract_id(event).and_then(|id| self.get_group(id))
    }

    /// Whether this event participates in the group machinery at all.
    /// Group-management kinds are claimed even without an `h` tag so a
    /// malformed request is rejected instead of stored as plain content.
    pub fn is_group_event(&self, event: &Event) -> bool {
        is_relay_state_kind(event.kind)
            || event.has_tag("h")
            || is_moderation_kind(event.kind)
            || matches!(
                event.kind,
                KIND_GROUP_CREATE | KIND_GROUP_JOIN_REQUEST | KIND_GROUP_LEAVE_REQUEST
            )
    }

    /// Records an accepted group event into its group's timeline.
    pub fn record_accepted(&self, event: &Event) {
        if !event.has_tag("h") {
            return;
        }
        if let Some(id) = Group::extract_id(event) {
            if let Some(mut group) = self.groups.get_mut(id) {
                group.record_timeline_ref(&event.id);
            }
        }
    }

    /// Turns one group event into state mutations plus the storage
    /// commands to run. Returns `None` when the event is not a group
    /// event and should flow on to the generic store path.
    pub fn handle_event(&self, event: &Event) -> Result<Option<Vec<StoreCommand>>, Error> {
        if !self.is_group_event(event) {
            return Ok(None);
        }

        if event.kind == KIND_GROUP_CREATE {
            return self.handle_group_create(event).map(Some);
        }

        if is_relay_state_kind(event.kind) {
            return self.handle_relay_state(event).map(Some);
        }

        let commands = match event.kind {
            KIND_GROUP_JOIN_REQUEST => self.handle_join_request(event)?,
            KIND_GROUP_LEAVE_REQUEST => self.handle_leave_request(event)?,
            kind if is_moderation_kind(kind) => self.handle_moderation(event)?,
            _ => self.handle_content(event)?,
        };

        Ok(Some(commands))
    }

    fn handle_group_create(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let Some(group_id) = Group::extract_id(event) else {
            return Err(Error::notice("invalid: group id not found"));
        };
        if self.groups.contains_key(group_id) {
            return Err(Error::duplicate("duplicate: group already exists"));
        }

        let group = Group::new(event)?;
        let commands = vec![
            StoreCommand::SaveSignedEvent(event.clone()),
            StoreCommand::SaveUnsignedEvent(group.metadata_event()),
            StoreCommand::SaveUnsignedEvent(group.put_user_event(&event.pubkey)),
            StoreCommand::SaveUnsignedEvent(group.admins_event()),
            StoreCommand::SaveUnsignedEvent(group.members_event()),
            StoreCommand::SaveUnsignedEvent(group.roles_event()),
        ];
        self.groups.insert(group.id.clone(), group);
        debug!("group {} created by {}", group_id, event.pubkey);
        Ok(commands)
    }

    /// 39000..39003 snapshots are only acceptable from the relay itself;
    /// they overwrite the corresponding state wholesale.
    fn handle_relay_state(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        if event.pubkey != self.relay_pubkey {
            return Err(Error::restricted(
                "only the relay may publish group state events",
            ));
        }

        let Some(group_id) = Group::extract_id(event) else {
            return Err(Error::notice("invalid: group id not found"));
        };

        let mut group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| Group::new_with_id(group_id.to_string(), event.created_at));

        match event.kind {
            KIND_GROUP_METADATA => group.load_metadata_from_event(event),
            KIND_GROUP_ADMINS | KIND_GROUP_MEMBERS => group.load_members_from_event(event),
            _ => {}
        }

        Ok(vec![StoreCommand::SaveSignedEvent(event.clone())])
    }

    fn handle_join_request(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let Some(mut group) = self.find_group_from_event_mut(event)? else {
            return Err(Error::notice("Group not found"));
        };

        group.check_previous_refs(event)?;
        let admitted = group.join_request(event, unix_now())?;

        let mut commands = vec![StoreCommand::SaveSignedEvent(event.clone())];
        if admitted {
            commands.push(StoreCommand::SaveUnsignedEvent(
                group.put_user_event(&event.pubkey),
            ));
            commands.push(StoreCommand::SaveUnsignedEvent(group.members_event()));
        }
        Ok(commands)
    }

    fn handle_leave_request(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let Some(mut group) = self.find_group_from_event_mut(event)? else {
            return Err(Error::notice("Group not found"));
        };

        if !group.leave_request(event)? {
            return Err(Error::notice("invalid: not a member of this group"));
        }

        Ok(vec![
            StoreCommand::SaveSignedEvent(event.clone()),
            StoreCommand::SaveUnsignedEvent(group.remove_user_event(&event.pubkey)),
            StoreCommand::SaveUnsignedEvent(group.members_event()),
        ])
    }

    fn handle_moderation(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let Some(group_id) = Group::extract_id(event).map(str::to_string) else {
            return Err(Error::notice("invalid: group id not found"));
        };
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Err(Error::notice("Group not found"));
        };

        if !group.can_moderate(&event.pubkey, event.kind, &self.relay_pubkey) {
            return Err(Error::restricted(
                "publisher is not authorized for this moderation action",
            ));
        }

        group.check_previous_refs(event)?;

        let commands = match event.kind {
            KIND_GROUP_PUT_USER => {
                group.put_user(event)?;
                vec![
                    StoreCommand::SaveSignedEvent(event.clone()),
                    StoreCommand::SaveUnsignedEvent(group.admins_event()),
                    StoreCommand::SaveUnsignedEvent(group.members_event()),
                ]
            }
            KIND_GROUP_REMOVE_USER => {
                let removed_privileged = group.remove_user(event)?;
                let mut commands = vec![StoreCommand::SaveSignedEvent(event.clone())];
                if removed_privileged {
                    commands.push(StoreCommand::SaveUnsignedEvent(group.admins_event()));
                }
                commands.push(StoreCommand::SaveUnsignedEvent(group.members_event()));
                commands
            }
            KIND_GROUP_EDIT_METADATA => {
                group.set_metadata(event)?;
                vec![
                    StoreCommand::SaveSignedEvent(event.clone()),
                    StoreCommand::SaveUnsignedEvent(group.metadata_event()),
                ]
            }
            KIND_GROUP_DELETE_EVENT => group.delete_event_request(event)?,
            KIND_GROUP_DELETE => {
                let commands = group.delete_group_request(event)?;
                drop(group);
                self.groups.remove(&group_id);
                info!("group {} deleted", group_id);
                return Ok(commands);
            }
            KIND_GROUP_CREATE_INVITE => {
                group.create_invite(event)?;
                vec![StoreCommand::SaveSignedEvent(event.clone())]
            }
            _ => {
                return Err(Error::notice(format!(
                    "invalid: unsupported moderation kind {}",
                    event.kind
                )))
            }
        };

        Ok(commands)
    }

    /// Ordinary content bearing an `h` tag: the group must exist, the
    /// publisher must be a member unless the group is public, and open
    /// groups auto-admit posting strangers.
    fn handle_content(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let Some(mut group) = self.find_group_from_event_mut(event)? else {
            return Err(Error::notice("Group not found"));
        };

        group.check_previous_refs(event)?;

        let is_member = group.is_member(&event.pubkey);
        let mut commands = vec![StoreCommand::SaveSignedEvent(event.clone())];

        if !is_member {
            if group.metadata.open {
                group.add_pubkey(event.pubkey.clone(), event.created_at);
                commands.push(StoreCommand::SaveUnsignedEvent(
                    group.put_user_event(&event.pubkey),
                ));
                commands.push(StoreCommand::SaveUnsignedEvent(group.members_event()));
            } else if !group.metadata.public {
                return Err(Error::restricted(format!(
                    "user {} is not a member of this group",
                    event.pubkey
                )));
            }
        }

        Ok(commands)
    }

    fn find_group_from_event_mut(
        &self,
        event: &Event,
    ) -> Result<Option<RefMut<'_, String, Group>>, Error> {
        let Some(group_id) = Group::extract_id(event) else {
            return Err(Error::notice("invalid: group id not found"));
        };
        Ok(self.get_group_mut(group_id))
    }

    /// REQ gate: `#h` filters against non-public groups need an
    /// authenticated member (or the relay key).
    pub fn verify_filters(
        &self,
        authed_pubkey: Option<&str>,
        filters: &[Filter],
    ) -> Result<(), Error> {
        for filter in filters {
            self.verify_filter(authed_pubkey, filter)?;
        }
        Ok(())
    }

    fn verify_filter(&self, authed_pubkey: Option<&str>, filter: &Filter) -> Result<(), Error> {
        let Some(group_ids) = filter.tags.get("h") else {
            return Ok(());
        };

        for group_id in group_ids {
            let Some(group) = self.get_group(group_id) else {
                continue;
            };
            if group.metadata.public {
                continue;
            }

            match authed_pubkey {
                None => {
                    return Err(Error::auth_required("reading from a private group"));
                }
                Some(pubkey) => {
                    if pubkey == self.relay_pubkey {
                        continue;
                    }
                    if !group.is_member(pubkey) {
                        return Err(Error::restricted(
                            "authed user is not a member of this group",
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Outbound gate: whether an event may be shown to this reader.
    pub fn can_deliver(&self, authed_pubkey: &Option<String>, event: &Event) -> bool {
        let Some(group) = self.find_group_from_event(event) else {
            return true;
        };
        group
            .can_see_event(authed_pubkey, &self.relay_pubkey, event)
            .unwrap_or(false)
    }
}
