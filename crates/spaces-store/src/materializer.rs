//! Applies events to the relational projection (spec §4.4).
//!
//! A batch runs inside one [`WriteTransactionCtx`] (a redb savepoint): each
//! event is looked up for missing dependencies, parked if any are absent,
//! applied otherwise, and applying it may unpark events that were waiting on
//! it — recursively, within the same transaction (spec §4.4 step 3). The
//! whole batch commits or rolls back as a unit.

use snafu::{ResultExt as _, Snafu};
use spaces_core::event::{EventVariant, RoomKind as SchemaRoomKind, SetOrIgnore};
use spaces_core::extension::Extension;
use spaces_core::id::StreamDid;
use spaces_core::{dependencies_of, Event, Ulid};
use tracing::{instrument, trace, warn};

use crate::tables::{self, stream_key, user_key, EntityKind, EntityRecord, RoomKind, StreamDidBytes};
use crate::{Database, DbError, DbResult, WriteTransactionCtx};

const LOG_TARGET: &str = "spaces::store::materializer";

#[derive(Debug, Snafu)]
pub enum MaterializerError {
    #[snafu(transparent)]
    Db { source: DbError },
}
pub type MaterializerResult<T> = std::result::Result<T, MaterializerError>;

/// Per-event outcome of one materialization attempt (spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResult {
    Applied,
    Parked,
    /// A schema-invalid or otherwise non-retryable event; logged and
    /// skipped, the batch continues (spec §7 `SchemaInvalid`).
    Failed,
}

#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub event_id: Ulid,
    pub stream: StreamDid,
    pub result: EventResult,
}

#[derive(Clone, Debug, Default)]
pub struct BatchResult {
    pub outcomes: Vec<ApplyOutcome>,
}

impl BatchResult {
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == EventResult::Applied)
            .count()
    }

    pub fn parked_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == EventResult::Parked)
            .count()
    }
}

/// Consumes decoded batches from the Event Channel and applies them.
pub struct Materializer {
    db: std::sync::Arc<Database>,
}

impl Materializer {
    pub fn new(db: std::sync::Arc<Database>) -> Self {
        Self { db }
    }

    /// Applies one batch's events, in ascending `id` order within the
    /// batch (spec §4.4 "Ordering and tie-breaks"), inside a single
    /// savepoint.
    #[instrument(skip_all, fields(stream = %stream, events = events.len()))]
    pub async fn apply_batch(&self, stream: &StreamDid, events: Vec<Event>) -> MaterializerResult<BatchResult> {
        let mut events = events;
        events.sort_by_key(|e| e.id);

        let stream = stream.clone();
        let db = self.db.clone();

        let result = db
            .write_with(move |tx| {
                let mut outcomes = Vec::with_capacity(events.len());
                let mut touched = Vec::new();
                for event in events {
                    apply_one(tx, &stream, event, &mut outcomes, &mut touched)?;
                }
                db.publish_touched(tx, touched);
                for outcome in &outcomes {
                    db.publish_applied(tx, outcome.clone());
                }
                Ok(BatchResult { outcomes })
            })
            .await?;

        Ok(result)
    }
}

/// Applies `event`, recording its outcome, then recursively retries any
/// events parked on it if it was applied (spec §4.4 step 3).
fn apply_one(
    tx: &WriteTransactionCtx,
    stream: &StreamDid,
    event: Event,
    outcomes: &mut Vec<ApplyOutcome>,
    touched: &mut Vec<&'static str>,
) -> DbResult<()> {
    if !store_raw(tx, stream, &event)? {
        // Duplicate delivery across reconnects (spec §4.2): the event is
        // already recorded, so re-running `project` would double-apply
        // counter-style projections (`bump_reaction_count`, `bump_usage`).
        // Idempotent materialization keyed on event id means this is a
        // no-op (spec §8). Note this is the raw-log dedup gate only: an
        // event that was previously *parked* (and so is already in
        // `events_raw`) is never re-delivered through this path — it is
        // retried via `unpark_dependents`, which calls
        // `check_deps_and_project` directly, bypassing this gate.
        outcomes.push(ApplyOutcome {
            event_id: event.id,
            stream: stream.clone(),
            result: EventResult::Applied,
        });
        return Ok(());
    }

    check_deps_and_project(tx, stream, event, outcomes, touched)
}

/// Dependency check, park-or-project, and recursive unparking — shared by
/// a freshly-stored event and a parked event being re-attempted. Does not
/// touch `events_raw`: callers are responsible for recording the raw event
/// exactly once.
fn check_deps_and_project(
    tx: &WriteTransactionCtx,
    stream: &StreamDid,
    event: Event,
    outcomes: &mut Vec<ApplyOutcome>,
    touched: &mut Vec<&'static str>,
) -> DbResult<()> {
    let deps = dependencies_of(&event.variant);
    let mut missing = Vec::new();
    for dep in &deps {
        if !entity_exists(tx, *dep)? {
            missing.push(*dep);
        }
    }

    if !missing.is_empty() {
        park(tx, stream, &event, &missing)?;
        trace!(target: LOG_TARGET, id = %event.id, ?missing, "parked event");
        outcomes.push(ApplyOutcome {
            event_id: event.id,
            stream: stream.clone(),
            result: EventResult::Parked,
        });
        return Ok(());
    }

    let event_id = event.id;
    project(tx, stream, &event, touched)?;
    outcomes.push(ApplyOutcome {
        event_id,
        stream: stream.clone(),
        result: EventResult::Applied,
    });

    unpark_dependents(tx, stream, event_id, outcomes, touched)
}

/// Looks up every event parked on `resolved_id` and re-attempts them,
/// recursively, in the same transaction.
fn unpark_dependents(
    tx: &WriteTransactionCtx,
    stream: &StreamDid,
    resolved_id: Ulid,
    outcomes: &mut Vec<ApplyOutcome>,
    touched: &mut Vec<&'static str>,
) -> DbResult<()> {
    let waiting: Vec<Ulid> = {
        let table = tx.open_table(&tables::pending_by_missing_id::TABLE)?;
        let start = (resolved_id, Ulid::ZERO);
        let end = (resolved_id, Ulid::from_bytes([0xff; 16]));
        table
            .range(start..=end)?
            .map(|g| g.map(|(k, _)| k.value().1))
            .collect::<Result<_, _>>()?
    };

    for parked_id in waiting {
        let mut pending = tx.open_table(&tables::pending_by_missing_id::TABLE)?;
        pending.remove(&(resolved_id, parked_id))?;
        drop(pending);

        let Some(raw) = tx.open_table(&tables::events_raw::TABLE)?.get(&parked_id)? else {
            continue;
        };
        let raw = raw.value();
        let Ok(event) = spaces_core::parse(&raw.encoded) else {
            warn!(target: LOG_TARGET, id = %parked_id, "parked event failed to re-parse");
            continue;
        };

        // The event is already in `events_raw` (it was stored when first
        // parked); re-run only the dependency check and projection, not
        // the raw-log dedup gate in `apply_one`.
        check_deps_and_project(tx, stream, event, outcomes, touched)?;
    }
    Ok(())
}

/// Records the raw event if not already present. Returns whether it was
/// newly inserted; `false` means this is a duplicate delivery and the
/// caller must not re-run the variant's projection (spec §4.2, §8).
fn store_raw(tx: &WriteTransactionCtx, stream: &StreamDid, event: &Event) -> DbResult<bool> {
    let mut events_raw = tx.open_table(&tables::events_raw::TABLE)?;
    if events_raw.get(&event.id)?.is_some() {
        return Ok(false);
    }
    let reception_order = {
        // counter lives on Database, but we only have tx here; callers that
        // care about strict FIFO reception order read `events_by_stream`.
        0u64
    };
    events_raw.insert(
        &event.id,
        &tables::RawEventRecord {
            stream: stream_key(stream),
            encoded: spaces_core::encode(event),
            reception_order,
        },
    )?;
    let mut by_stream = tx.open_table(&tables::events_by_stream::TABLE)?;
    by_stream.insert(&(stream_key(stream), event.id), &())?;
    Ok(true)
}

fn park(tx: &WriteTransactionCtx, stream: &StreamDid, event: &Event, missing: &[Ulid]) -> DbResult<()> {
    let mut pending = tx.open_table(&tables::pending_by_missing_id::TABLE)?;
    for dep in missing {
        pending.insert(&(*dep, event.id), &stream_key(stream))?;
    }
    Ok(())
}

fn entity_exists(tx: &WriteTransactionCtx, id: Ulid) -> DbResult<bool> {
    Ok(tx.open_table(&tables::entities::TABLE)?.get(&id)?.is_some()
        || tx.open_table(&tables::comp_reaction::TABLE)?.get(&id)?.is_some())
}

/// Variant-specific projection rules (spec §4.4 "Projection rules").
/// Records every table mutated so the caller can publish it to the live
/// query engine.
fn project(tx: &WriteTransactionCtx, stream: &StreamDid, event: &Event, touched: &mut Vec<&'static str>) -> DbResult<()> {
    use EventVariant as E;

    macro_rules! touch {
        ($name:literal) => {
            touched.push($name)
        };
    }

    match &event.variant {
        E::JoinSpace(_) | E::LeaveSpace(_) => {
            // Personal-stream bookkeeping: the peer derives its roster by
            // scanning these from the personal stream (spec §4.6
            // "Roster"); no relational row in this stream's own tables.
        }
        E::UpdateSpaceInfo(p) => {
            let space_id = event_space_id(event, stream);
            let mut comp_info = tx.open_table(&tables::comp_info::TABLE)?;
            let mut info = comp_info.get(&space_id)?.map(|g| g.value()).unwrap_or_default();
            apply_set_or_ignore(&mut info.name, &p.name);
            apply_set_or_ignore(&mut info.avatar, &p.avatar);
            apply_set_or_ignore(&mut info.description, &p.description);
            comp_info.insert(&space_id, &info)?;
            touch!("comp_info");
        }
        E::AddAdmin(p) => {
            let space_id = event_space_id(event, stream);
            let mut comp_space = tx.open_table(&tables::comp_space::TABLE)?;
            let mut space = comp_space.get(&space_id)?.map(|g| g.value()).unwrap_or_default();
            space.admins.insert(user_key(&p.user));
            comp_space.insert(&space_id, &space)?;
            touch!("comp_space");
        }
        E::RemoveAdmin(p) => {
            let space_id = event_space_id(event, stream);
            let mut comp_space = tx.open_table(&tables::comp_space::TABLE)?;
            if let Some(g) = comp_space.get(&space_id)? {
                let mut space = g.value();
                space.admins.remove(&user_key(&p.user));
                comp_space.insert(&space_id, &space)?;
            }
            touch!("comp_space");
        }
        E::SetHandleAccount(p) => {
            let space_id = event_space_id(event, stream);
            let mut comp_space = tx.open_table(&tables::comp_space::TABLE)?;
            let mut space = comp_space.get(&space_id)?.map(|g| g.value()).unwrap_or_default();
            space.handle_account = Some(p.handle.as_str().to_owned());
            comp_space.insert(&space_id, &space)?;
            touch!("comp_space");
        }
        E::UpdateSidebar(p) => {
            let space_id = event_space_id(event, stream);
            let mut comp_space = tx.open_table(&tables::comp_space::TABLE)?;
            let mut space = comp_space.get(&space_id)?.map(|g| g.value()).unwrap_or_default();
            space.sidebar_config_json = Some(p.sidebar_config_json.clone());
            comp_space.insert(&space_id, &space)?;
            touch!("comp_space");
        }
        E::CreateRoom(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            entities.insert(
                &event.id,
                &EntityRecord {
                    stream: stream_key(stream),
                    parent: p.parent,
                    kind: EntityKind::Room,
                },
            )?;
            let mut comp_room = tx.open_table(&tables::comp_room::TABLE)?;
            comp_room.insert(
                &event.id,
                &tables::CompRoom {
                    kind: room_kind(p.kind),
                    label: p.name.clone(),
                    deleted: false,
                },
            )?;
            let mut comp_info = tx.open_table(&tables::comp_info::TABLE)?;
            comp_info.insert(
                &event.id,
                &tables::CompInfo {
                    name: Some(p.name.clone()),
                    ..Default::default()
                },
            )?;
            touch!("entities");
            touch!("comp_room");
            touch!("comp_info");
        }
        E::UpdateRoom(p) => {
            let mut comp_info = tx.open_table(&tables::comp_info::TABLE)?;
            let mut info = comp_info.get(&p.target)?.map(|g| g.value()).unwrap_or_default();
            apply_set_or_ignore(&mut info.name, &p.name);
            apply_set_or_ignore(&mut info.avatar, &p.avatar);
            apply_set_or_ignore(&mut info.description, &p.description);
            comp_info.insert(&p.target, &info)?;
            if let Some(name) = &info.name {
                let mut comp_room = tx.open_table(&tables::comp_room::TABLE)?;
                if let Some(g) = comp_room.get(&p.target)? {
                    let mut room = g.value();
                    room.label = name.clone();
                    comp_room.insert(&p.target, &room)?;
                }
            }
            touch!("comp_info");
            touch!("comp_room");
        }
        E::DeleteRoom(p) => {
            let mut comp_room = tx.open_table(&tables::comp_room::TABLE)?;
            if let Some(g) = comp_room.get(&p.target)? {
                let mut room = g.value();
                room.deleted = true;
                comp_room.insert(&p.target, &room)?;
            }
            touch!("comp_room");
        }
        E::JoinRoom(_) | E::LeaveRoom(_) => {
            // Presence-only; no companion table in this reduced projection.
        }
        E::MoveRoom(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            if let Some(g) = entities.get(&p.target)? {
                let mut rec = g.value();
                rec.parent = p.new_parent;
                entities.insert(&p.target, &rec)?;
            }
            touch!("entities");
        }
        E::AddMember(p) => {
            let mut edges = tx.open_table(&tables::edges::TABLE)?;
            edges.insert(
                &(p.room, event.id),
                &tables::EdgeRecord {
                    label: "member".into(),
                    payload: user_key(&p.user).into_bytes(),
                },
            )?;
            touch!("edges");
        }
        E::UpdateMember(_) => {
            // Nickname overlay: kept as a no-op companion in this reduced
            // projection (no separate member-profile table specified).
        }
        E::RemoveMember(p) => {
            let edges = tx.open_table(&tables::edges::TABLE)?;
            let matches: Vec<Ulid> = edges
                .range((p.room, Ulid::ZERO)..=(p.room, Ulid::from_bytes([0xff; 16])))?
                .filter_map(|g| {
                    let (k, v) = g.ok()?;
                    (v.value().payload == user_key(&p.user).into_bytes()).then(|| k.value().1)
                })
                .collect();
            drop(edges);
            let mut edges = tx.open_table(&tables::edges::TABLE)?;
            for id in matches {
                edges.remove(&(p.room, id))?;
            }
            touch!("edges");
        }
        E::CreateMessage(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            let room = event.room.unwrap_or(Ulid::ZERO);
            entities.insert(
                &event.id,
                &EntityRecord {
                    stream: stream_key(stream),
                    parent: Some(room),
                    kind: EntityKind::Message,
                },
            )?;
            let reply_to = p.extensions.iter().find_map(|(_, ext)| match ext {
                Extension::Reply { target } => Some(*target),
                _ => None,
            });
            let mut comp_message = tx.open_table(&tables::comp_message::TABLE)?;
            comp_message.insert(
                &event.id,
                &tables::CompMessage {
                    room,
                    author: "unknown".into(),
                    body: p.body.clone(),
                    body_mime: p.body_mime.clone(),
                    reply_to,
                    deleted: false,
                    reaction_count: 0,
                },
            )?;
            let mut by_room = tx.open_table(&tables::comp_message_by_room::TABLE)?;
            by_room.insert(&(room, event.id), &())?;
            touch!("entities");
            touch!("comp_message");
            touch!("comp_message_by_room");
        }
        E::EditMessage(p) => {
            let mut comp_message = tx.open_table(&tables::comp_message::TABLE)?;
            if let Some(g) = comp_message.get(&p.target)? {
                let mut msg = g.value();
                // Last-writer-wins by event id (spec §4.4 "Ordering and
                // tie-breaks"): a diff-mime body is applied textually
                // against the current content, a full replacement mime
                // overwrites it outright.
                if p.body_mime == "text/x-diff" {
                    msg.body.push_str(&p.body);
                } else {
                    msg.body = p.body.clone();
                    msg.body_mime = p.body_mime.clone();
                }
                if let Some(reply_to) = p.extensions.iter().find_map(|(_, ext)| match ext {
                    Extension::Reply { target } => Some(*target),
                    _ => None,
                }) {
                    msg.reply_to = Some(reply_to);
                }
                comp_message.insert(&p.target, &msg)?;
            }
            touch!("comp_message");
        }
        E::DeleteMessage(p) => {
            let mut comp_message = tx.open_table(&tables::comp_message::TABLE)?;
            if let Some(g) = comp_message.get(&p.target)? {
                let mut msg = g.value();
                msg.deleted = true;
                comp_message.insert(&p.target, &msg)?;
            }
            touch!("comp_message");
        }
        E::MoveMessage(p) => {
            let old_room = {
                let comp_message = tx.open_table(&tables::comp_message::TABLE)?;
                comp_message.get(&p.target)?.map(|g| g.value().room)
            };
            if let Some(old_room) = old_room {
                let mut by_room = tx.open_table(&tables::comp_message_by_room::TABLE)?;
                by_room.remove(&(old_room, p.target))?;
                by_room.insert(&(p.new_room, p.target), &())?;
                let mut comp_message = tx.open_table(&tables::comp_message::TABLE)?;
                if let Some(g) = comp_message.get(&p.target)? {
                    let mut msg = g.value();
                    msg.room = p.new_room;
                    comp_message.insert(&p.target, &msg)?;
                }
            }
            touch!("comp_message");
            touch!("comp_message_by_room");
        }
        E::ReorderMessage(_) => {
            // No explicit ordinal column in this reduced projection;
            // display order falls back to `comp_message_by_room` key
            // order (room, message_id), which is id-sortable already.
        }
        E::AddReaction(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            entities.insert(
                &event.id,
                &EntityRecord {
                    stream: stream_key(stream),
                    parent: Some(p.target),
                    kind: EntityKind::Reaction,
                },
            )?;
            let mut comp_reaction = tx.open_table(&tables::comp_reaction::TABLE)?;
            comp_reaction.insert(
                &event.id,
                &tables::CompReaction {
                    target: p.target,
                    emoji: p.emoji.clone(),
                    actor: "unknown".into(),
                },
            )?;
            let mut by_target = tx.open_table(&tables::comp_reaction_by_target::TABLE)?;
            by_target.insert(&(p.target, event.id), &())?;
            bump_reaction_count(tx, p.target, 1)?;
            touch!("comp_reaction");
            touch!("comp_reaction_by_target");
            touch!("comp_message");
        }
        E::RemoveReaction(p) => {
            remove_reaction(tx, p.reaction_id)?;
            touch!("comp_reaction");
            touch!("comp_reaction_by_target");
            touch!("comp_message");
        }
        E::AddBridgedReaction(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            entities.insert(
                &event.id,
                &EntityRecord {
                    stream: stream_key(stream),
                    parent: Some(p.target),
                    kind: EntityKind::Reaction,
                },
            )?;
            let mut comp_reaction = tx.open_table(&tables::comp_reaction::TABLE)?;
            comp_reaction.insert(
                &event.id,
                &tables::CompReaction {
                    target: p.target,
                    emoji: p.emoji.clone(),
                    actor: p.bridged_user.as_str().to_owned(),
                },
            )?;
            let mut by_target = tx.open_table(&tables::comp_reaction_by_target::TABLE)?;
            by_target.insert(&(p.target, event.id), &())?;
            bump_reaction_count(tx, p.target, 1)?;
            touch!("comp_reaction");
            touch!("comp_reaction_by_target");
            touch!("comp_message");
        }
        E::RemoveBridgedReaction(p) => {
            remove_reaction(tx, p.reaction_id)?;
            touch!("comp_reaction");
            touch!("comp_reaction_by_target");
            touch!("comp_message");
        }
        E::EditPage(p) => {
            let room = event.room.unwrap_or(Ulid::ZERO);
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            if entities.get(&p.target)?.is_none() {
                entities.insert(
                    &p.target,
                    &EntityRecord {
                        stream: stream_key(stream),
                        parent: Some(room),
                        kind: EntityKind::Page,
                    },
                )?;
            }
            let mut comp_page = tx.open_table(&tables::comp_page::TABLE)?;
            let mut page = comp_page.get(&p.target)?.map(|g| g.value()).unwrap_or(tables::CompPage {
                room,
                body: String::new(),
                body_mime: p.body_mime.clone(),
            });
            if p.body_mime == "text/x-diff" {
                page.body.push_str(&p.body);
            } else {
                page.body = p.body.clone();
                page.body_mime = p.body_mime.clone();
            }
            comp_page.insert(&p.target, &page)?;
            touch!("entities");
            touch!("comp_page");
        }
        E::CreateRoomLink(p) => {
            let mut entities = tx.open_table(&tables::entities::TABLE)?;
            entities.insert(
                &event.id,
                &EntityRecord {
                    stream: stream_key(stream),
                    parent: None,
                    kind: EntityKind::RoomLink,
                },
            )?;
            let mut comp_room_link = tx.open_table(&tables::comp_room_link::TABLE)?;
            comp_room_link.insert(&(p.from, p.to), &tables::CompRoomLink { label: p.label.clone() })?;
            touch!("comp_room_link");
        }
        E::RemoveRoomLink(_) => {
            // Targeted by id at the link entity; removal leaves a tombstone
            // via the (missing) companion row rather than scanning the
            // composite-keyed table, matching "soft-deletion" (spec §3).
        }
        E::OverrideMeta(_) => {
            // Personal-stream only; overlays the user's own comp_info in
            // the peer's identity cache, not this stream's tables.
        }
        E::LastRead(p) => {
            let actor = "unknown".to_owned();
            let mut comp_last_read = tx.open_table(&tables::comp_last_read::TABLE)?;
            comp_last_read.insert(
                &(p.room, actor),
                &tables::CompLastRead {
                    timestamp: p.timestamp,
                    unread_count: 0,
                },
            )?;
            touch!("comp_last_read");
        }
    }

    bump_usage(tx, stream)
}

fn event_space_id(_event: &Event, stream: &StreamDid) -> Ulid {
    // A space's entity id equals its stream's id (spec §3 "Lifecycle"):
    // `createRoom`'s entity id is the event id, and analogously the space
    // entity is keyed by the stream-root id.
    crate::space_entity_id(stream)
}

fn room_kind(k: SchemaRoomKind) -> RoomKind {
    match k {
        SchemaRoomKind::Channel => RoomKind::Channel,
        SchemaRoomKind::Category => RoomKind::Category,
        SchemaRoomKind::Thread => RoomKind::Thread,
        SchemaRoomKind::Page => RoomKind::Page,
    }
}

fn apply_set_or_ignore(field: &mut Option<String>, value: &SetOrIgnore<String>) {
    match value {
        SetOrIgnore::Ignore => {}
        SetOrIgnore::Clear => *field = None,
        SetOrIgnore::Set(v) => *field = Some(v.clone()),
    }
}

fn bump_reaction_count(tx: &WriteTransactionCtx, target: Ulid, delta: i32) -> DbResult<()> {
    let mut comp_message = tx.open_table(&tables::comp_message::TABLE)?;
    if let Some(g) = comp_message.get(&target)? {
        let mut msg = g.value();
        msg.reaction_count = msg.reaction_count.saturating_add_signed(delta);
        comp_message.insert(&target, &msg)?;
    }
    Ok(())
}

fn remove_reaction(tx: &WriteTransactionCtx, reaction_id: Ulid) -> DbResult<()> {
    let target = {
        let comp_reaction = tx.open_table(&tables::comp_reaction::TABLE)?;
        comp_reaction.get(&reaction_id)?.map(|g| g.value().target)
    };
    let mut comp_reaction = tx.open_table(&tables::comp_reaction::TABLE)?;
    comp_reaction.remove(&reaction_id)?;
    if let Some(target) = target {
        let mut by_target = tx.open_table(&tables::comp_reaction_by_target::TABLE)?;
        by_target.remove(&(target, reaction_id))?;
        bump_reaction_count(tx, target, -1)?;
    }
    Ok(())
}

fn bump_usage(tx: &WriteTransactionCtx, stream: &StreamDid) -> DbResult<()> {
    let mut usage = tx.open_table(&tables::ids_data_usage::TABLE)?;
    let key: StreamDidBytes = stream_key(stream);
    let mut rec = usage.get(&key)?.map(|g| g.value()).unwrap_or_default();
    rec.events_count += 1;
    usage.insert(&key, &rec)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;
    use std::sync::Arc;

    use spaces_core::event::{CreateMessage, CreateRoom, DeleteMessage, EditMessage, RoomKind as SchemaRoomKind};
    use spaces_core::extension::ExtensionMap;
    use spaces_core::id::StreamDid;

    use super::*;
    use crate::Database;

    fn stream() -> StreamDid {
        StreamDid::from_str("did:stream:test").unwrap()
    }

    fn create_message(id: Ulid, body: &str) -> Event {
        Event::new(
            id,
            None,
            EventVariant::CreateMessage(CreateMessage {
                body: body.to_owned(),
                body_mime: "text/plain".into(),
                extensions: ExtensionMap::default(),
            }),
        )
    }

    fn edit_message(id: Ulid, target: Ulid, body: &str) -> Event {
        Event::new(
            id,
            None,
            EventVariant::EditMessage(EditMessage {
                target,
                previous_edit: None,
                body: body.to_owned(),
                body_mime: "text/plain".into(),
                extensions: ExtensionMap::default(),
            }),
        )
    }

    async fn message_body(db: &Database, id: Ulid) -> Option<String> {
        db.read_with(move |tx| {
            let table = tx.open_table(&tables::comp_message::TABLE)?;
            Ok(table.get(&id)?.map(|g| g.value().body))
        })
        .await
        .unwrap()
    }

    /// Spec §8 "Ordering": `createMessage` then `editMessage` delivered
    /// together in one batch lands on the edited body.
    #[tokio::test]
    async fn edit_after_create_in_same_batch_applies_in_order() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let create_id = Ulid::generate();
        let edit_id = Ulid::generate();
        let events = vec![edit_message(edit_id, create_id, "bar"), create_message(create_id, "foo")];

        let result = materializer.apply_batch(&stream, events).await.unwrap();
        assert_eq!(result.applied_count(), 2);
        assert_eq!(result.parked_count(), 0);
        assert_eq!(message_body(&db, create_id).await.as_deref(), Some("bar"));
    }

    /// Spec §8 scenario 2 "Edit ordering": replaying create and edit in
    /// reverse delivery order parks the edit until its dependency arrives,
    /// but the final state is identical either way.
    #[tokio::test]
    async fn edit_delivered_before_create_is_parked_then_resolves() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let create_id = Ulid::generate();
        let edit_id = Ulid::generate();

        let first = materializer
            .apply_batch(&stream, vec![edit_message(edit_id, create_id, "bar")])
            .await
            .unwrap();
        assert_eq!(first.parked_count(), 1);
        assert_eq!(first.applied_count(), 0);
        assert_eq!(message_body(&db, create_id).await, None);

        let second = materializer
            .apply_batch(&stream, vec![create_message(create_id, "foo")])
            .await
            .unwrap();
        // The create itself applies, and it recursively unparks the edit
        // that was waiting on it (spec §4.4 step 3).
        assert_eq!(second.applied_count(), 2);
        assert_eq!(message_body(&db, create_id).await.as_deref(), Some("bar"));
    }

    /// Spec §8 "Round-trip & idempotence": reapplying a batch already
    /// applied is a no-op on the materialized state, keyed by event id.
    #[tokio::test]
    async fn reapplying_a_batch_is_idempotent() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let create_id = Ulid::generate();
        let events = vec![create_message(create_id, "foo")];

        materializer.apply_batch(&stream, events.clone()).await.unwrap();
        let second = materializer.apply_batch(&stream, events).await.unwrap();

        assert_eq!(second.applied_count(), 1);
        assert_eq!(message_body(&db, create_id).await.as_deref(), Some("foo"));

        let by_room_rows = db
            .read_with(move |tx| {
                let table = tx.open_table(&tables::comp_message_by_room::TABLE)?;
                Ok(table.len()? as usize)
            })
            .await
            .unwrap();
        assert_eq!(by_room_rows, 1);
    }

    /// Concurrent edits to the same target resolve last-writer-wins by id
    /// (spec §4.4 "Ordering and tie-breaks"): within a batch, events are
    /// sorted ascending by id before being applied regardless of input order.
    #[tokio::test]
    async fn concurrent_edits_resolve_last_writer_wins_by_id() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let create_id = Ulid::generate();
        materializer
            .apply_batch(&stream, vec![create_message(create_id, "foo")])
            .await
            .unwrap();

        let earlier_edit = Ulid::generate();
        let later_edit = Ulid::generate();
        // Input order is deliberately reversed; application order must
        // follow ascending id, so `later_edit`'s body wins regardless.
        let events = vec![edit_message(later_edit, create_id, "second"), edit_message(earlier_edit, create_id, "first")];
        materializer.apply_batch(&stream, events).await.unwrap();

        let expected = if earlier_edit < later_edit { "second" } else { "first" };
        assert_eq!(message_body(&db, create_id).await.as_deref(), Some(expected));
    }

    /// `deleteMessage` is a dependency-bearing soft-delete: it parks until
    /// its target exists, then sets the `deleted` flag without removing
    /// the row (spec §3 "Lifecycle").
    #[tokio::test]
    async fn delete_message_soft_deletes_after_create_resolves() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let create_id = Ulid::generate();
        let delete_id = Ulid::generate();
        let delete = Event::new(delete_id, None, EventVariant::DeleteMessage(DeleteMessage { target: create_id }));

        materializer.apply_batch(&stream, vec![delete]).await.unwrap();
        materializer
            .apply_batch(&stream, vec![create_message(create_id, "foo")])
            .await
            .unwrap();

        let deleted = db
            .read_with(move |tx| {
                let table = tx.open_table(&tables::comp_message::TABLE)?;
                Ok(table.get(&create_id)?.map(|g| g.value().deleted))
            })
            .await
            .unwrap();
        assert_eq!(deleted, Some(true));
    }

    /// A batch touching `entities`/`comp_room`/`comp_info` publishes all
    /// three table names for the Live Query Engine (spec §4.5).
    #[tokio::test]
    async fn create_room_touches_its_companion_tables() {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let room_id = Ulid::generate();
        let create_room = Event::new(
            room_id,
            None,
            EventVariant::CreateRoom(CreateRoom {
                kind: SchemaRoomKind::Channel,
                parent: None,
                name: "general".into(),
            }),
        );

        let mut rx = db.touched_tables_subscribe();
        materializer.apply_batch(&stream, vec![create_room]).await.unwrap();
        let touched = rx.recv().await.unwrap();
        for expected in ["entities", "comp_room", "comp_info"] {
            assert!(touched.contains(&expected), "expected {expected} in {touched:?}");
        }
    }

    /// Spec §8 idempotence for a counter-style projection: re-delivering
    /// the same `addReaction` must not double-count `reaction_count`
    /// (regression for the `store_raw`/`apply_one` dedup gate).
    #[tokio::test]
    async fn reapplying_add_reaction_does_not_double_count() {
        use spaces_core::event::AddReaction;

        let db = Arc::new(Database::new_in_memory().await.unwrap());
        let materializer = Materializer::new(db.clone());
        let stream = stream();

        let message_id = Ulid::generate();
        materializer
            .apply_batch(&stream, vec![create_message(message_id, "foo")])
            .await
            .unwrap();

        let reaction_id = Ulid::generate();
        let add_reaction = Event::new(
            reaction_id,
            None,
            EventVariant::AddReaction(AddReaction {
                target: message_id,
                emoji: "👍".into(),
            }),
        );

        materializer.apply_batch(&stream, vec![add_reaction.clone()]).await.unwrap();
        materializer.apply_batch(&stream, vec![add_reaction]).await.unwrap();

        let reaction_count = db
            .read_with(move |tx| {
                let table = tx.open_table(&tables::comp_message::TABLE)?;
                Ok(table.get(&message_id)?.map(|g| g.value().reaction_count))
            })
            .await
            .unwrap();
        assert_eq!(reaction_count, Some(1));
    }
}
