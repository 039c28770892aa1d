//! `dependencies_of` — a total function from event to the ids that must be
//! materialized first (spec §3 "Dependency declarations", §4.1, §9).
//!
//! Kept as a lookup table keyed by variant, separate from the variant
//! definitions themselves, per the design note "Dynamic dispatch on event
//! variants": schema and materialization stay decoupled.

use crate::event::EventVariant;
use crate::extension::Extension;
use crate::Ulid;

/// Every id this event must see materialized before it may itself be
/// applied. Events not in the closed dependency-bearing set return an
/// empty vec (never `None` — the function is total).
pub fn dependencies_of(variant: &EventVariant) -> Vec<Ulid> {
    use EventVariant as E;
    match variant {
        E::UpdateRoom(p) => vec![p.target],
        E::DeleteRoom(p) => vec![p.target],
        E::EditMessage(p) => {
            let mut deps = vec![p.target];
            deps.extend(p.previous_edit);
            deps.extend(reply_dep(&p.extensions));
            deps
        }
        E::DeleteMessage(p) => vec![p.target],
        E::MoveMessage(p) => vec![p.target],
        E::ReorderMessage(p) => {
            let mut deps = vec![p.target];
            deps.extend(p.after);
            deps
        }
        E::AddReaction(p) => vec![p.target],
        E::RemoveReaction(p) => vec![p.reaction_id],
        E::AddBridgedReaction(p) => vec![p.target],
        E::RemoveBridgedReaction(p) => vec![p.reaction_id],
        E::EditPage(p) => {
            let mut deps = vec![p.target];
            deps.extend(p.previous_edit);
            deps
        }
        E::RemoveRoomLink(p) => vec![p.target],
        E::OverrideMeta(_) => Vec::new(),
        _ => Vec::new(),
    }
}

fn reply_dep(extensions: &crate::extension::ExtensionMap) -> Option<Ulid> {
    extensions.iter().find_map(|(_, ext)| match ext {
        Extension::Reply { target } => Some(*target),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeleteMessage, EditMessage};
    use crate::extension::ExtensionMap;

    #[test]
    fn delete_message_depends_on_target() {
        let target = Ulid::generate();
        let deps = dependencies_of(&EventVariant::DeleteMessage(DeleteMessage { target }));
        assert_eq!(deps, vec![target]);
    }

    #[test]
    fn edit_message_depends_on_target_and_previous_edit() {
        let target = Ulid::generate();
        let previous_edit = Ulid::generate();
        let deps = dependencies_of(&EventVariant::EditMessage(EditMessage {
            target,
            previous_edit: Some(previous_edit),
            body: String::new(),
            body_mime: "text/plain".into(),
            extensions: ExtensionMap::default(),
        }));
        assert_eq!(deps, vec![target, previous_edit]);
    }

    #[test]
    fn override_meta_has_no_dependencies() {
        use crate::event::{OverrideMeta, SetOrIgnore};
        let deps = dependencies_of(&EventVariant::OverrideMeta(OverrideMeta {
            display_name: SetOrIgnore::Ignore,
            avatar: SetOrIgnore::Ignore,
        }));
        assert!(deps.is_empty());
    }
}
