use crate::error::Error;
use crate::event::{unix_now, Event, EventDraft, Tag};
use crate::filter::Filter;
use crate::store::StoreCommand;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, warn};

// Moderation actions (9000-9020)
pub const KIND_GROUP_PUT_USER: u32 = 9000;
pub const KIND_GROUP_REMOVE_USER: u32 = 9001;
pub const KIND_GROUP_EDIT_METADATA: u32 = 9002;
pub const KIND_GROUP_DELETE_EVENT: u32 = 9005;
pub const KIND_GROUP_CREATE: u32 = 9007;
pub const KIND_GROUP_DELETE: u32 = 9008;
pub const KIND_GROUP_CREATE_INVITE: u32 = 9009;

// User actions
pub const KIND_GROUP_JOIN_REQUEST: u32 = 9021;
pub const KIND_GROUP_LEAVE_REQUEST: u32 = 9022;

// Relay-authored state snapshots (39000-39003)
pub const KIND_GROUP_METADATA: u32 = 39000;
pub const KIND_GROUP_ADMINS: u32 = 39001;
pub const KIND_GROUP_MEMBERS: u32 = 39002;
pub const KIND_GROUP_ROLES: u32 = 39003;

pub const RELAY_STATE_KINDS: [u32; 4] = [
    KIND_GROUP_METADATA,
    KIND_GROUP_ADMINS,
    KIND_GROUP_MEMBERS,
    KIND_GROUP_ROLES,
];

pub fn is_moderation_kind(kind: u32) -> bool {
    (9000..=9020).contains(&kind) && kind != KIND_GROUP_CREATE
}

pub fn is_relay_state_kind(kind: u32) -> bool {
    RELAY_STATE_KINDS.contains(&kind)
}

/// Short id prefix used by `previous` tags to chain group events.
pub const TIMELINE_REF_LEN: usize = 8;

/// Role required to publish a given moderation kind. Kinds without an
/// entry are not accepted from anyone but the relay.
pub fn required_role(kind: u32) -> Option<GroupRole> {
    match kind {
        KIND_GROUP_PUT_USER
        | KIND_GROUP_REMOVE_USER
        | KIND_GROUP_EDIT_METADATA
        | KIND_GROUP_CREATE
        | KIND_GROUP_DELETE
        | KIND_GROUP_CREATE_INVITE => Some(GroupRole::Admin),
        KIND_GROUP_DELETE_EVENT => Some(GroupRole::Moderator),
        _ => None,
    }
}

#[derive(Display, Debug, Clone, EnumIter, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum GroupRole {
    Admin,
    Moderator,
    Member,
    #[strum(to_string = "{0}")]
    Custom(String),
}

impl GroupRole {
    pub fn description(&self) -> &str {
        match self {
            GroupRole::Admin => "Can edit metadata and manage users",
            GroupRole::Moderator => "Can remove events from the group",
            GroupRole::Member => "Regular group member",
            GroupRole::Custom(_) => "Custom role",
        }
    }
}

impl FromStr for GroupRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "" | "member" => Ok(GroupRole::Member),
            "admin" => Ok(GroupRole::Admin),
            "moderator" => Ok(GroupRole::Moderator),
            custom => Ok(GroupRole::Custom(custom.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub pubkey: String,
    pub roles: HashSet<GroupRole>,
    pub joined_at: u64,
}

impl GroupMember {
    pub fn new(pubkey: String, roles: HashSet<GroupRole>, joined_at: u64) -> Self {
        Self {
            pubkey,
            roles,
            joined_at,
        }
    }

    pub fn member(pubkey: String, joined_at: u64) -> Self {
        Self::new(pubkey, HashSet::from([GroupRole::Member]), joined_at)
    }

    pub fn admin(pubkey: String, joined_at: u64) -> Self {
        Self::new(pubkey, HashSet::from([GroupRole::Admin]), joined_at)
    }

    pub fn is(&self, role: &GroupRole) -> bool {
        self.roles.contains(role)
    }
}

/// Parses a NIP-29 `p` tag: pubkey followed by zero or more role names.
impl TryFrom<&Tag> for GroupMember {
    type Error = Error;

    fn try_from(tag: &Tag) -> Result<Self, Error> {
        let [name, pubkey, roles @ ..] = tag.0.as_slice() else {
            return Err(Error::notice("invalid: malformed member tag"));
        };
        if name != "p" {
            return Err(Error::notice("invalid: member tag must be a 'p' tag"));
        }
        if pubkey.len() != 64 || !pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::notice("invalid: malformed member pubkey"));
        }

        let roles = if roles.is_empty() {
            HashSet::from([GroupRole::Member])
        } else {
            roles
                .iter()
                .map(|r| GroupRole::from_str(r))
                .collect::<Result<_, _>>()?
        };

        Ok(Self::new(pubkey.clone(), roles, unix_now()))
    }
}

#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub name: String,
    pub about: Option<String>,
    pub picture: Option<String>,
    /// Public groups are readable without authentication.
    pub public: bool,
    /// Open groups admit join requests without an invite.
    pub open: bool,
}

impl GroupMetadata {
    pub fn new(name: String) -> Self {
        Self {
            name,
            about: None,
            picture: None,
            public: false,
            open: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invite {
    pub code: String,
    pub creator: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub max_uses: u32,
    pub used_count: u32,
}

impl Invite {
    pub fn is_usable(&self, now: u64) -> bool {
        self.used_count < self.max_uses && self.expires_at.map_or(true, |at| now <= at)
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub metadata: GroupMetadata,
    pub members: HashMap<String, GroupMember>,
    pub invites: HashMap<String, Invite>,
    pub roles: HashSet<GroupRole>,
    /// Short prefixes of accepted event ids, checked against `previous`
    /// tags for moderation resistance.
    pub timeline_refs: HashSet<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Group {
    pub fn new_with_id(id: String, created_at: u64) -> Self {
        Self {
            metadata: GroupMetadata::new(id.clone()),
            id,
            members: HashMap::new(),
            invites: HashMap::new(),
            roles: HashSet::new(),
            timeline_refs: HashSet::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Builds a group from its 9007 create event; the creator becomes the
    /// first admin.
    pub fn new(event: &Event) -> Result<Self, Error> {
        let Some(group_id) = Self::extract_id(event) else {
            return Err(Error::notice("invalid: group id not found"));
        };

        let mut group = Self::new_with_id(group_id.to_string(), event.created_at);
        group.set_metadata(event)?;
        group.members.insert(
            event.pubkey.clone(),
            GroupMember::admin(event.pubkey.clone(), event.created_at),
        );
        group.update_roles();
        Ok(group)
    }

    /// The group id an event refers to: the `d` tag for relay state
    /// kinds, the `h` tag for everything else.
    pub fn extract_id(event: &Event) -> Option<&str> {
        if is_relay_state_kind(event.kind) {
            event.tag_value("d")
        } else {
            event.tag_value("h")
        }
    }

    fn touch(&mut self, at: u64) {
        self.updated_at = self.updated_at.max(at);
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.members.contains_key(pubkey)
    }

    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.members
            .get(pubkey)
            .is_some_and(|m| m.is(&GroupRole::Admin))
    }

    pub fn admin_pubkeys(&self) -> Vec<&str> {
        self.members
            .values()
            .filter(|m| m.is(&GroupRole::Admin))
            .map(|m| m.pubkey.as_str())
            .collect()
    }

    /// Moderation authorization: the relay key bypasses every check;
    /// otherwise the publisher's role set must carry the required role
    /// (admins pass every gate).
    pub fn can_moderate(&self, pubkey: &str, kind: u32, relay_pubkey: &str) -> bool {
        if pubkey == relay_pubkey {
            debug!("relay key authorized for kind {} in {}", kind, self.id);
            return true;
        }
        let Some(required) = required_role(kind) else {
            return false;
        };
        self.members
            .get(pubkey)
            .is_some_and(|m| m.is(&required) || m.is(&GroupRole::Admin))
    }

    // -- membership ------------------------------------------------------

    /// Handles a 9021 join request. True means the member was admitted.
    pub fn join_request(&mut self, event: &Event, now: u64) -> Result<bool, Error> {
        if self.is_member(&event.pubkey) {
            return Err(Error::duplicate("duplicate: already a member"));
        }

        if self.metadata.open {
            self.admit(event.pubkey.clone(), event.created_at);
            self.touch(event.created_at);
            return Ok(true);
        }

        let invite_accepted = match event
            .tag_value("code")
            .and_then(|code| self.invites.get_mut(code))
        {
            Some(invite) if invite.is_usable(now) => {
                invite.used_count += 1;
                true
            }
            _ => false,
        };

        if !invite_accepted {
            return Err(Error::notice(
                "Group is closed and no valid invite code provided",
            ));
        }

        self.admit(event.pubkey.clone(), event.created_at);
        self.touch(event.created_at);
        Ok(true)
    }

    fn admit(&mut self, pubkey: String, joined_at: u64) {
        self.members
            .entry(pubkey.clone())
            .or_insert_with(|| GroupMember::member(pubkey, joined_at));
        self.update_roles();
    }

    /// Auto-join used when a non-member posts to an open group.
    pub fn add_pubkey(&mut self, pubkey: String, at: u64) {
        self.admit(pubkey, at);
        self.touch(at);
    }

    /// Handles a 9022 leave request. True means a membership was removed.
    pub fn leave_request(&mut self, event: &Event) -> Result<bool, Error> {
        let removed = self.members.remove(&event.pubkey).is_some();
        if removed {
            self.update_roles();
            self.touch(event.created_at);
        }
        Ok(removed)
    }

    /// Handles a 9000 put-user: every `p` tag names a member, optional
    /// trailing fields or event-level `role` tags carry roles.
    pub fn put_user(&mut self, event: &Event) -> Result<(), Error> {
        let fallback_roles: HashSet<GroupRole> = event
            .tag_values("role")
            .iter()
            .map(|r| GroupRole::from_str(r))
            .collect::<Result<_, _>>()?;

        let mut added = false;
        for tag in event.tags.iter().filter(|t| t.name() == "p") {
            let mut member = GroupMember::try_from(tag)?;
            member.joined_at = event.created_at;
            if member.roles == HashSet::from([GroupRole::Member]) && !fallback_roles.is_empty() {
                member.roles = fallback_roles.clone();
            }
            self.members.insert(member.pubkey.clone(), member);
            added = true;
        }

        if !added {
            return Err(Error::notice("invalid: put-user without 'p' tags"));
        }

        self.update_roles();
        self.touch(event.created_at);
        Ok(())
    }

    /// Handles a 9001 remove-user. True if any removed member held an
    /// elevated role.
    pub fn remove_user(&mut self, event: &Event) -> Result<bool, Error> {
        let admins: Vec<String> = self
            .admin_pubkeys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut removed_privileged = false;

        for tag in event.tags.iter().filter(|t| t.name() == "p") {
            let Some(pubkey) = tag.value() else {
                return Err(Error::notice("invalid: malformed member tag"));
            };

            if admins.len() == 1 && admins[0] == pubkey {
                return Err(Error::notice("invalid: cannot remove the last admin"));
            }

            if let Some(member) = self.members.remove(pubkey) {
                if !member.roles.iter().all(|r| *r == GroupRole::Member) {
                    removed_privileged = true;
                }
            }
        }

        self.update_roles();
        self.touch(event.created_at);
        Ok(removed_privileged)
    }

    // -- metadata --------------------------------------------------------

    /// Applies name/about/picture and the public/open marker tags from a
    /// 9002, 9007 or 39000 event.
    pub fn set_metadata(&mut self, event: &Event) -> Result<(), Error> {
        if event.kind != KIND_GROUP_EDIT_METADATA
            && event.kind != KIND_GROUP_CREATE
            && event.kind != KIND_GROUP_METADATA
        {
            return Err(Error::notice(format!(
                "invalid: kind {} does not carry group metadata",
                event.kind
            )));
        }

        if event.has_tag("public") {
            self.metadata.public = true;
        } else if event.has_tag("private") {
            self.metadata.public = false;
        }

        if event.has_tag("open") {
            self.metadata.open = true;
        } else if event.has_tag("closed") {
            self.metadata.open = false;
        }

        if let Some(name) = event.tag_value("name") {
            self.metadata.name = name.to_string();
        }
        if let Some(about) = event.tag_value("about") {
            self.metadata.about = Some(about.to_string());
        }
        if let Some(picture) = event.tag_value("picture") {
            self.metadata.picture = Some(picture.to_string());
        }

        self.touch(event.created_at);
        Ok(())
    }

    // -- invites ---------------------------------------------------------

    /// Handles a 9009: registers an invite with optional `code`,
    /// `max_uses` (default 1) and `expires_at` tags.
    pub fn create_invite(&mut self, event: &Event) -> Result<String, Error> {
        let code = match event.tag_value("code") {
            Some(code) => code.to_string(),
            None => format!("{:016x}", rand::random::<u64>()),
        };

        if self.invites.contains_key(&code) {
            return Err(Error::duplicate("duplicate: invite code already exists"));
        }

        let max_uses = event
            .tag_value("max_uses")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        let expires_at = event.tag_value("expires_at").and_then(|v| v.parse::<u64>().ok());

        self.invites.insert(
            code.clone(),
            Invite {
                code: code.clone(),
                creator: event.pubkey.clone(),
                created_at: event.created_at,
                expires_at,
                max_uses,
                used_count: 0,
            },
        );
        self.touch(event.created_at);
        Ok(code)
    }

    // -- deletion --------------------------------------------------------

    /// A 9005 delete-event: removes the events named by `e` tags, then
    /// records the request itself.
    pub fn delete_event_request(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let ids: Vec<String> = event
            .tag_values("e")
            .into_iter()
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err(Error::notice("invalid: delete-event without 'e' tags"));
        }

        Ok(vec![
            StoreCommand::DeleteEvents(Filter::new().ids(ids)),
            StoreCommand::SaveSignedEvent(event.clone()),
        ])
    }

    /// A 9008 delete-group: cascade-deletes everything tied to the group,
    /// then records the request itself.
    pub fn delete_group_request(&self, event: &Event) -> Result<Vec<StoreCommand>, Error> {
        let timeline = Filter::new().tag("h", [self.id.clone()]);
        let state = Filter::new()
            .kinds(RELAY_STATE_KINDS)
            .tag("d", [self.id.clone()]);

        Ok(vec![
            StoreCommand::DeleteEvents(timeline),
            StoreCommand::DeleteEvents(state),
            StoreCommand::SaveSignedEvent(event.clone()),
        ])
    }

    // -- timeline references --------------------------------------------

    pub fn record_timeline_ref(&mut self, event_id: &str) {
        if event_id.len() >= TIMELINE_REF_LEN {
            self.timeline_refs
                .insert(event_id[..TIMELINE_REF_LEN].to_string());
        }
    }

    /// Every `previous` tag value must be a known timeline reference.
    pub fn check_previous_refs(&self, event: &Event) -> Result<(), Error> {
        for reference in event.tag_values("previous") {
            if !self.timeline_refs.contains(reference) {
                warn!(
                    "unknown previous reference '{}' in event {}",
                    reference, event.id
                );
                return Err(Error::notice(
                    "invalid: unknown previous timeline reference",
                ));
            }
        }
        Ok(())
    }

    // -- read visibility -------------------------------------------------

    /// Whether a (possibly unauthenticated) reader may see a group event.
    pub fn can_see_event(
        &self,
        authed_pubkey: &Option<String>,
        relay_pubkey: &str,
        event: &Event,
    ) -> Result<bool, Error> {
        if self.metadata.public {
            return Ok(true);
        }

        let Some(authed_pubkey) = authed_pubkey else {
            return Err(Error::auth_required("reading from a private group"));
        };

        if authed_pubkey == relay_pubkey || *authed_pubkey == event.pubkey {
            return Ok(true);
        }

        if self.is_admin(authed_pubkey) {
            return Ok(true);
        }

        // Members see everything except invites.
        if self.is_member(authed_pubkey) && event.kind != KIND_GROUP_CREATE_INVITE {
            return Ok(true);
        }

        Ok(false)
    }

    // -- state loading (startup) ----------------------------------------

    pub fn load_metadata_from_event(&mut self, event: &Event) {
        self.metadata = GroupMetadata {
            name: event.tag_value("name").unwrap_or(&self.id).to_string(),
            about: event.tag_value("about").map(str::to_string),
            picture: event.tag_value("picture").map(str::to_string),
            public: event.has_tag("public"),
            open: event.has_tag("open"),
        };
        self.touch(event.created_at);
    }

    pub fn load_members_from_event(&mut self, event: &Event) {
        for tag in event.tags.iter().filter(|t| t.name() == "p") {
            if let Ok(mut member) = GroupMember::try_from(tag) {
                member.joined_at = event.created_at;
                // Admin snapshots win over plain membership rows.
                self.members
                    .entry(member.pubkey.clone())
                    .and_modify(|existing| {
                        if member.roles != HashSet::from([GroupRole::Member]) {
                            existing.roles = member.roles.clone();
                        }
                    })
                    .or_insert(member);
            }
        }
        self.update_roles();
        self.touch(event.created_at);
    }

    pub fn load_invite_from_event(&mut self, event: &Event) {
        let _ = self.create_invite(event);
    }

    // -- relay-authored snapshots ---------------------------------------

    pub fn metadata_event(&self) -> EventDraft {
        let access = if self.metadata.public { "public" } else { "private" };
        let policy = if self.metadata.open { "open" } else { "closed" };

        let mut draft = EventDraft::new(KIND_GROUP_METADATA, "")
            .tag(Tag::new(["d", self.id.as_str()]))
            .tag(Tag::new(["name", self.metadata.name.as_str()]))
            .tag(Tag::new([access]))
            .tag(Tag::new([policy]));

        if let Some(about) = &self.metadata.about {
            draft = draft.tag(Tag::new(["about", about.as_str()]));
        }
        if let Some(picture) = &self.metadata.picture {
            draft = draft.tag(Tag::new(["picture", picture.as_str()]));
        }
        draft
    }

    pub fn admins_event(&self) -> EventDraft {
        let mut tags = vec![Tag::new(["d", self.id.as_str()])];
        for member in self.members.values().filter(|m| m.is(&GroupRole::Admin)) {
            let mut fields = vec!["p".to_string(), member.pubkey.clone()];
            fields.extend(member.roles.iter().map(ToString::to_string));
            tags.push(Tag(fields));
        }
        EventDraft::new(KIND_GROUP_ADMINS, "").tags(tags)
    }

    pub fn members_event(&self) -> EventDraft {
        let mut tags = vec![Tag::new(["d", self.id.as_str()])];
        for pubkey in self.members.keys() {
            tags.push(Tag::new(["p", pubkey.as_str()]));
        }
        EventDraft::new(KIND_GROUP_MEMBERS, "").tags(tags)
    }

    pub fn roles_event(&self) -> EventDraft {
        let mut tags = vec![Tag::new(["d", self.id.as_str()])];
        for role in GroupRole::iter() {
            if matches!(role, GroupRole::Custom(_)) {
                continue;
            }
            let name = role.to_string();
            tags.push(Tag::new(["role", name.as_str(), role.description()]));
        }
        EventDraft::new(KIND_GROUP_ROLES, "List of roles supported by this group").tags(tags)
    }

    pub fn put_user_event(&self, pubkey: &str) -> EventDraft {
        EventDraft::new(KIND_GROUP_PUT_USER, "")
            .tag(Tag(vec![
                "p".to_string(),
                pubkey.to_string(),
                GroupRole::Member.to_string(),
            ]))
            .tag(Tag::new(["h", self.id.as_str()]))
    }

    pub fn remove_user_event(&self, pubkey: &str) -> EventDraft {
        EventDraft::new(KIND_GROUP_REMOVE_USER, "")
            .tag(Tag::new(["p", pubkey]))
            .tag(Tag::new(["h", self.id.as_str()]))
    }

    fn update_roles(&mut self) {
        self.roles = self
            .members
            .values()
            .flat_map(|m| m.roles.iter().cloned())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RelayKeys;
    use crate::test_utils::{sign_test_event, sign_test_event_at};

    fn test_keys() -> (RelayKeys, RelayKeys, RelayKeys) {
        (
            RelayKeys::generate(),
            RelayKeys::generate(),
            RelayKeys::generate(),
        )
    }

    fn create_group(admin: &RelayKeys) -> Group {
        let event = sign_test_event(
            admin,
            KIND_GROUP_CREATE,
            vec![Tag::new(["h", "test_group"])],
            "",
        );
        Group::new(&event).unwrap()
    }

    #[test]
    fn creation_makes_the_creator_admin() {
        let (admin, _, _) = test_keys();
        let group = create_group(&admin);
        assert_eq!(group.id, "test_group");
        assert!(group.is_admin(&admin.public_key));
        assert!(!group.metadata.public);
        assert!(!group.metadata.open);
    }

    #[test]
    fn open_groups_admit_join_requests() {
        let (admin, member, _) = test_keys();
        let mut group = create_group(&admin);
        group.metadata.open = true;

        let join = sign_test_event(
            &member,
            KIND_GROUP_JOIN_REQUEST,
            vec![Tag::new(["h", "test_group"])],
            "",
        );
        assert!(group.join_request(&join, unix_now()).unwrap());
        assert!(group.is_member(&member.public_key));

        // A second join request is a duplicate.
        assert!(group.join_request(&join, unix_now()).is_err());
    }

    #[test]
    fn closed_groups_need_a_usable_invite() {
        let (admin, member, other) = test_keys();
        let mut group = create_group(&admin);

        let create_invite = sign_test_event(
            &admin,
            KIND_GROUP_CREATE_INVITE,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["code", "c1"]),
                Tag::new(["max_uses", "1"]),
            ],
            "",
        );
        group.create_invite(&create_invite).unwrap();

        let no_code = sign_test_event(
            &member,
            KIND_GROUP_JOIN_REQUEST,
            vec![Tag::new(["h", "test_group"])],
            "",
        );
        let err = group.join_request(&no_code, unix_now()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Group is closed and no valid invite code provided"
        );

        let with_code = sign_test_event(
            &member,
            KIND_GROUP_JOIN_REQUEST,
            vec![Tag::new(["h", "test_group"]), Tag::new(["code", "c1"])],
            "",
        );
        assert!(group.join_request(&with_code, unix_now()).unwrap());
        assert!(group.is_member(&member.public_key));

        // The invite is exhausted now.
        let second_use = sign_test_event(
            &other,
            KIND_GROUP_JOIN_REQUEST,
            vec![Tag::new(["h", "test_group"]), Tag::new(["code", "c1"])],
            "",
        );
        let err = group.join_request(&second_use, unix_now()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Group is closed and no valid invite code provided"
        );
    }

    #[test]
    fn expired_invites_are_unusable() {
        let (admin, member, _) = test_keys();
        let mut group = create_group(&admin);

        let create_invite = sign_test_event_at(
            &admin,
            KIND_GROUP_CREATE_INVITE,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["code", "c1"]),
                Tag::new(["expires_at", "100"]),
            ],
            "",
            50,
        );
        group.create_invite(&create_invite).unwrap();

        let join = sign_test_event(
            &member,
            KIND_GROUP_JOIN_REQUEST,
            vec![Tag::new(["h", "test_group"]), Tag::new(["code", "c1"])],
            "",
        );
        assert!(group.join_request(&join, 200).is_err());
        assert!(group.join_request(&join, 100).is_ok());
    }

    #[test]
    fn put_and_remove_user() {
        let (admin, member, _) = test_keys();
        let mut group = create_group(&admin);

        let put = sign_test_event(
            &admin,
            KIND_GROUP_PUT_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", member.public_key.as_str()]),
            ],
            "",
        );
        group.put_user(&put).unwrap();
        assert!(group.is_member(&member.public_key));
        assert!(!group.is_admin(&member.public_key));

        let remove = sign_test_event(
            &admin,
            KIND_GROUP_REMOVE_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", member.public_key.as_str()]),
            ],
            "",
        );
        group.remove_user(&remove).unwrap();
        assert!(!group.is_member(&member.public_key));
    }

    #[test]
    fn cannot_remove_the_last_admin() {
        let (admin, _, _) = test_keys();
        let mut group = create_group(&admin);

        let remove = sign_test_event(
            &admin,
            KIND_GROUP_REMOVE_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", admin.public_key.as_str()]),
            ],
            "",
        );
        assert!(group.remove_user(&remove).is_err());
        assert!(group.is_admin(&admin.public_key));
    }

    #[test]
    fn roles_from_p_tag_fields() {
        let (admin, member, _) = test_keys();
        let mut group = create_group(&admin);

        let put = sign_test_event(
            &admin,
            KIND_GROUP_PUT_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", member.public_key.as_str(), "moderator"]),
            ],
            "",
        );
        group.put_user(&put).unwrap();
        assert!(group
            .members
            .get(&member.public_key)
            .unwrap()
            .is(&GroupRole::Moderator));
        assert!(group.roles.contains(&GroupRole::Moderator));
    }

    #[test]
    fn moderation_authorization_follows_the_role_map() {
        let (admin, member, relay) = test_keys();
        let mut group = create_group(&admin);

        let put = sign_test_event(
            &admin,
            KIND_GROUP_PUT_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", member.public_key.as_str(), "moderator"]),
            ],
            "",
        );
        group.put_user(&put).unwrap();

        // Admin passes both admin-gated and moderator-gated actions.
        assert!(group.can_moderate(&admin.public_key, KIND_GROUP_PUT_USER, &relay.public_key));
        assert!(group.can_moderate(&admin.public_key, KIND_GROUP_DELETE_EVENT, &relay.public_key));

        // Moderator passes only the 9005 gate.
        assert!(group.can_moderate(&member.public_key, KIND_GROUP_DELETE_EVENT, &relay.public_key));
        assert!(!group.can_moderate(&member.public_key, KIND_GROUP_PUT_USER, &relay.public_key));

        // The relay key passes everything.
        assert!(group.can_moderate(&relay.public_key, KIND_GROUP_PUT_USER, &relay.public_key));

        // Unmapped moderation kinds are closed to everyone but the relay.
        assert!(!group.can_moderate(&admin.public_key, 9010, &relay.public_key));
        assert!(group.can_moderate(&relay.public_key, 9010, &relay.public_key));
    }

    #[test]
    fn metadata_edits_apply_marker_tags() {
        let (admin, _, _) = test_keys();
        let mut group = create_group(&admin);

        let edit = sign_test_event(
            &admin,
            KIND_GROUP_EDIT_METADATA,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["name", "My Group"]),
                Tag::new(["about", "About text"]),
                Tag::new(["picture", "https://example.com/p.png"]),
                Tag::new(["public"]),
                Tag::new(["open"]),
            ],
            "",
        );
        group.set_metadata(&edit).unwrap();
        assert_eq!(group.metadata.name, "My Group");
        assert_eq!(group.metadata.about.as_deref(), Some("About text"));
        assert!(group.metadata.public);
        assert!(group.metadata.open);
    }

    #[test]
    fn timeline_refs_gate_previous_tags() {
        let (admin, member, _) = test_keys();
        let mut group = create_group(&admin);

        let earlier = sign_test_event(&member, 9, vec![Tag::new(["h", "test_group"])], "one");
        group.record_timeline_ref(&earlier.id);

        let chained = sign_test_event(
            &member,
            9,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["previous", &earlier.id[..TIMELINE_REF_LEN]]),
            ],
            "two",
        );
        assert!(group.check_previous_refs(&chained).is_ok());

        let forged = sign_test_event(
            &member,
            9,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["previous", "deadbeef"]),
            ],
            "three",
        );
        assert!(group.check_previous_refs(&forged).is_err());
    }

    #[test]
    fn visibility_rules() {
        let (admin, member, stranger) = test_keys();
        let relay = RelayKeys::generate();
        let mut group = create_group(&admin);

        let put = sign_test_event(
            &admin,
            KIND_GROUP_PUT_USER,
            vec![
                Tag::new(["h", "test_group"]),
                Tag::new(["p", member.public_key.as_str()]),
            ],
            "",
        );
        group.put_user(&put).unwrap();

        let content = sign_test_event(&member, 9, vec![Tag::new(["h", "test_group"])], "hi");

        assert!(group
            .can_see_event(&Some(member.public_key.clone()), &relay.public_key, &content)
            .unwrap());
        assert!(!group
            .can_see_event(&Some(stranger.public_key.clone()), &relay.public_key, &content)
            .unwrap());
        assert!(group
            .can_see_event(&Some(relay.public_key.clone()), &relay.public_key, &content)
            .unwrap());
        assert!(group
            .can_see_event(&None, &relay.public_key, &content)
            .is_err());

        // Members cannot see invite events.
        let invite = sign_test_event(
            &admin,
            KIND_GROUP_CREATE_INVITE,
            vec![Tag::new(["h", "test_group"]), Tag::new(["code", "c1"])],
            "",
        );
        assert!(!group
            .can_see_event(&Some(member.public_key.clone()), &relay.public_key, &invite)
            .unwrap());

        group.metadata.public = true;
        assert!(group
            .can_see_event(&None, &relay.public_key, &content)
            .unwrap());
    }

    #[test]
    fn snapshots_carry_the_group_id() {
        let (admin, _, _) = test_keys();
        let group = create_group(&admin);

        for draft in [
            group.metadata_event(),
            group.admins_event(),
            group.members_event(),
            group.roles_event(),
        ] {
            assert!(draft
                .tags
                .iter()
                .any(|t| t.name() == "d" && t.value() == Some("test_group")));
        }

        let put = group.put_user_event(&admin.public_key);
        assert_eq!(put.kind, KIND_GROUP_PUT_USER);
        assert!(put.tags.iter().any(|t| t.name() == "h"));
    }

    #[test]
    fn state_reloads_from_snapshot_events() {
        let (admin, member, _) = test_keys();
        let relay = RelayKeys::generate();
        let mut group = Group::new_with_id("test_group".to_string(), 1);

        let metadata = sign_test_event(
            &relay,
            KIND_GROUP_METADATA,
            vec![
                Tag::new(["d", "test_group"]),
                Tag::new(["name", "Restored"]),
                Tag::new(["public"]),
                Tag::new(["closed"]),
            ],
            "",
        );
        group.load_metadata_from_event(&metadata);
        assert_eq!(group.metadata.name, "Restored");
        assert!(group.metadata.public);
        assert!(!group.metadata.open);

        let admins = sign_test_event(
            &relay,
            KIND_GROUP_ADMINS,
            vec![
                Tag::new(["d", "test_group"]),
                Tag::new(["p", admin.public_key.as_str(), "admin"]),
            ],
            "",
        );
        group.load_members_from_event(&admins);

        let members = sign_test_event(
            &relay,
            KIND_GROUP_MEMBERS,
            vec![
                Tag::new(["d", "test_group"]),
                Tag::new(["p", admin.public_key.as_str()]),
                Tag::new(["p", member.public_key.as_str()]),
            ],
            "",
        );
        group.load_members_from_event(&members);

        assert!(group.is_admin(&admin.public_key));
        assert!(group.is_member(&member.public_key));
        assert!(!group.is_admin(&member.public_key));
    }
}
