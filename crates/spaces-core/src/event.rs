//! The event envelope and the closed set of event variants (spec §3).

use crate::extension::ExtensionMap;
use crate::id::{Did, Handle, StreamDid, UserDid};
use crate::Ulid;

/// Every event carries an `id` (also its creation timestamp), an optional
/// `room` scoping it to a room within the same stream, and exactly one
/// [`EventVariant`].
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Event {
    pub id: Ulid,
    pub room: Option<Ulid>,
    pub variant: EventVariant,
}

impl Event {
    pub fn new(id: Ulid, room: Option<Ulid>, variant: EventVariant) -> Self {
        Self { id, room, variant }
    }

    /// The NSID wire tag for this event's variant, e.g.
    /// `space.roomy.message.createMessage.v0`.
    pub fn nsid(&self) -> &'static str {
        self.variant.nsid()
    }
}

/// A field that can be left absent (ignore), explicitly cleared (null), or
/// set to a new value — the "set-or-ignore" wrapper `updateRoom` and
/// similar partial-update variants use for optional fields (spec §4.4).
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum SetOrIgnore<T> {
    #[default]
    Ignore,
    Clear,
    Set(T),
}

macro_rules! event_variants {
    (
        $(
            $family:ident {
                $( $variant:ident($nsid:literal) => $payload:ty ),* $(,)?
            }
        ),* $(,)?
    ) => {
        #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[derive(Clone, PartialEq, Eq, Debug)]
        pub enum EventVariant {
            $( $( $variant($payload) ),* ),*
        }

        impl EventVariant {
            pub fn nsid(&self) -> &'static str {
                match self {
                    $( $( Self::$variant(_) => $nsid ),* ),*
                }
            }

            pub fn family(&self) -> EventFamily {
                match self {
                    $( $( Self::$variant(_) => EventFamily::$family ),* ),*
                }
            }
        }
    };
}

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventFamily {
    Space,
    Room,
    Message,
    Reaction,
    Page,
    Link,
    User,
}

event_variants! {
    Space {
        JoinSpace("space.roomy.space.joinSpace.v0") => JoinSpace,
        LeaveSpace("space.roomy.space.leaveSpace.v0") => LeaveSpace,
        UpdateSpaceInfo("space.roomy.space.updateSpaceInfo.v0") => UpdateSpaceInfo,
        AddAdmin("space.roomy.space.addAdmin.v0") => AddAdmin,
        RemoveAdmin("space.roomy.space.removeAdmin.v0") => RemoveAdmin,
        SetHandleAccount("space.roomy.space.setHandleAccount.v0") => SetHandleAccount,
        UpdateSidebar("space.roomy.space.updateSidebar.v0") => UpdateSidebar,
    },
    Room {
        CreateRoom("space.roomy.room.createRoom.v0") => CreateRoom,
        UpdateRoom("space.roomy.room.updateRoom.v0") => UpdateRoom,
        DeleteRoom("space.roomy.room.deleteRoom.v0") => DeleteRoom,
        JoinRoom("space.roomy.room.joinRoom.v0") => JoinRoom,
        LeaveRoom("space.roomy.room.leaveRoom.v0") => LeaveRoom,
        MoveRoom("space.roomy.room.move.v0") => MoveRoom,
        AddMember("space.roomy.room.addMember.v0") => AddMember,
        UpdateMember("space.roomy.room.updateMember.v0") => UpdateMember,
        RemoveMember("space.roomy.room.removeMember.v0") => RemoveMember,
    },
    Message {
        CreateMessage("space.roomy.message.createMessage.v0") => CreateMessage,
        EditMessage("space.roomy.message.editMessage.v0") => EditMessage,
        DeleteMessage("space.roomy.message.deleteMessage.v0") => DeleteMessage,
        MoveMessage("space.roomy.message.moveMessage.v0") => MoveMessage,
        ReorderMessage("space.roomy.message.reorderMessage.v0") => ReorderMessage,
    },
    Reaction {
        AddReaction("space.roomy.reaction.addReaction.v0") => AddReaction,
        RemoveReaction("space.roomy.reaction.removeReaction.v0") => RemoveReaction,
        AddBridgedReaction("space.roomy.reaction.addBridgedReaction.v0") => AddBridgedReaction,
        RemoveBridgedReaction("space.roomy.reaction.removeBridgedReaction.v0") => RemoveBridgedReaction,
    },
    Page {
        EditPage("space.roomy.page.editPage.v0") => EditPage,
    },
    Link {
        CreateRoomLink("space.roomy.link.createRoomLink.v0") => CreateRoomLink,
        RemoveRoomLink("space.roomy.link.removeRoomLink.v0") => RemoveRoomLink,
    },
    User {
        OverrideMeta("space.roomy.user.overrideMeta.v0") => OverrideMeta,
        LastRead("space.roomy.user.lastRead.v0") => LastRead,
    },
}

macro_rules! payload {
    ($name:ident { $( $field:ident : $ty:ty ),* $(,)? }) => {
        #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[derive(Clone, PartialEq, Eq, Debug)]
        pub struct $name {
            $( pub $field: $ty ),*
        }
    };
}

payload!(JoinSpace { space: StreamDid });
payload!(LeaveSpace { space: StreamDid });
payload!(UpdateSpaceInfo {
    name: SetOrIgnore<String>,
    avatar: SetOrIgnore<String>,
    description: SetOrIgnore<String>,
});
payload!(AddAdmin { user: UserDid });
payload!(RemoveAdmin { user: UserDid });
payload!(SetHandleAccount { handle: Handle });
/// `sidebar_config` is an ordered JSON array of `{name, children:[room_id,...]}`
/// categories (spec §9: JSON category list is the direction of travel).
payload!(UpdateSidebar { sidebar_config_json: String });

payload!(CreateRoom {
    kind: RoomKind,
    parent: Option<Ulid>,
    name: String,
});
payload!(UpdateRoom {
    name: SetOrIgnore<String>,
    avatar: SetOrIgnore<String>,
    description: SetOrIgnore<String>,
    target: Ulid,
});
payload!(DeleteRoom { target: Ulid });
payload!(JoinRoom { room: Ulid });
payload!(LeaveRoom { room: Ulid });
payload!(MoveRoom {
    target: Ulid,
    new_parent: Option<Ulid>,
});
payload!(AddMember { room: Ulid, user: UserDid });
payload!(UpdateMember {
    room: Ulid,
    user: UserDid,
    nickname: SetOrIgnore<String>,
});
payload!(RemoveMember { room: Ulid, user: UserDid });

#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RoomKind {
    Channel,
    Category,
    Thread,
    Page,
}

payload!(CreateMessage {
    body: String,
    body_mime: String,
    extensions: ExtensionMap,
});
payload!(EditMessage {
    target: Ulid,
    previous_edit: Option<Ulid>,
    body: String,
    body_mime: String,
    extensions: ExtensionMap,
});
payload!(DeleteMessage { target: Ulid });
payload!(MoveMessage { target: Ulid, new_room: Ulid });
payload!(ReorderMessage { target: Ulid, after: Option<Ulid> });

payload!(AddReaction { target: Ulid, emoji: String });
payload!(RemoveReaction { reaction_id: Ulid });
payload!(AddBridgedReaction {
    target: Ulid,
    emoji: String,
    bridged_user: Did,
});
payload!(RemoveBridgedReaction { reaction_id: Ulid });

payload!(EditPage {
    target: Ulid,
    previous_edit: Option<Ulid>,
    body: String,
    body_mime: String,
});

payload!(CreateRoomLink { from: Ulid, to: Ulid, label: String });
payload!(RemoveRoomLink { target: Ulid });

payload!(OverrideMeta {
    display_name: SetOrIgnore<String>,
    avatar: SetOrIgnore<String>,
});
payload!(LastRead { room: Ulid, timestamp: Ulid });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsid_matches_family() {
        let variant = EventVariant::CreateMessage(CreateMessage {
            body: "hi".into(),
            body_mime: "text/plain".into(),
            extensions: ExtensionMap::default(),
        });
        assert_eq!(variant.nsid(), "space.roomy.message.createMessage.v0");
        assert_eq!(variant.family(), EventFamily::Message);
    }
}
