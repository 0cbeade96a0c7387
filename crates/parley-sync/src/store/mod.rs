//! Normalized local store for chats and messages.
//!
//! Every chat and message is stored once, keyed by [`EntityKey`]. Query
//! results are kept as fields on the root entity that reference those
//! entities, so a message written by the live feed is immediately visible
//! through every list that references it. All writes go through the field
//! merge policies in [`policy`].
//!
//! The store is guarded by a synchronous mutex that is never held across an
//! `.await`; each operation runs to completion atomically.

pub mod policy;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use parley_backend::{Chat, ChatId, ChatWithMessages, Message, MessageId, MessagePreview};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

pub use policy::{MergeStrategy, TypePolicies, append_dedupe_sort};

/// Capacity for the store-event broadcast channel.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Id of the root entity holding query results.
pub const ROOT_QUERY: &str = "ROOT_QUERY";

/// Entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Query,
    Chat,
    Message,
}

impl EntityKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityKind::Query => "Query",
            EntityKind::Chat => "Chat",
            EntityKind::Message => "Message",
        }
    }
}

/// Identity of a normalized entity, rendered as `Chat:<id>` / `Message:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn root() -> Self {
        Self {
            kind: EntityKind::Query,
            id: ROOT_QUERY.to_string(),
        }
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Chat,
            id: id.into(),
        }
    }

    pub fn message(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Message,
            id: id.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == EntityKind::Query
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EntityKind::Query => write!(f, "{}", self.id),
            kind => write!(f, "{}:{}", kind.type_name(), self.id),
        }
    }
}

impl From<&ChatId> for EntityKey {
    fn from(id: &ChatId) -> Self {
        Self::chat(id.as_str())
    }
}

impl From<&MessageId> for EntityKey {
    fn from(id: &MessageId) -> Self {
        Self::message(id.as_str())
    }
}

/// Value of one entity field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Ref(EntityKey),
    RefList(Vec<EntityKey>),
    Count(u64),
}

impl FieldValue {
    fn refs(&self) -> &[EntityKey] {
        match self {
            FieldValue::Ref(key) => std::slice::from_ref(key),
            FieldValue::RefList(keys) => keys,
            FieldValue::Scalar(_) | FieldValue::Count(_) => &[],
        }
    }
}

/// A normalized record: named fields, some of which reference other entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

/// Storage key for a field, qualified by its arguments.
///
/// `field_key("messages", &json!({"chat_id": "c1"}))` is
/// `messages({"chat_id":"c1"})`; empty arguments give the bare name.
pub fn field_key(name: &str, args: &Value) -> String {
    match args {
        Value::Null => name.to_string(),
        Value::Object(map) if map.is_empty() => name.to_string(),
        args => format!("{}({})", name, args),
    }
}

/// Field name with any argument suffix stripped.
pub fn field_base_name(key: &str) -> &str {
    key.split_once('(').map_or(key, |(base, _)| base)
}

fn messages_field(chat_id: &ChatId) -> String {
    field_key("messages", &serde_json::json!({ "chat_id": chat_id }))
}

fn chat_field(chat_id: &ChatId) -> String {
    field_key("chat", &serde_json::json!({ "id": chat_id }))
}

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// One-shot query result.
    Fetch,
    /// Live-feed snapshot.
    Feed,
    /// Local edit after a successful mutation.
    Local,
}

/// Change notification for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Entities were written or modified.
    Written { origin: Origin, keys: Vec<EntityKey> },
    /// An entity was evicted.
    EntityEvicted { key: EntityKey },
    /// Fields with this base name were removed from `removed` entities.
    FieldEvicted { field: String, removed: usize },
    /// Unreachable entities were garbage-collected.
    Collected { removed: Vec<EntityKey> },
}

/// Field-level update for a cached chat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatPatch {
    pub title: Option<String>,
    /// Applied only when newer than the stored value.
    pub updated_at: Option<DateTime<Utc>>,
    pub message_count: Option<u64>,
    pub latest: Option<MessagePreview>,
}

struct Inner {
    entities: HashMap<EntityKey, Entity>,
}

impl Inner {
    fn created_at(&self, key: &EntityKey) -> Option<DateTime<Utc>> {
        match self.entities.get(key)?.get("created_at")? {
            FieldValue::Scalar(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Merge `incoming` into one field using the registered strategy.
    fn write_field(
        &mut self,
        policies: &TypePolicies,
        key: &EntityKey,
        field: String,
        incoming: FieldValue,
    ) {
        let strategy = policies.strategy_for(key.kind, field_base_name(&field));
        let existing = self.entities.get(key).and_then(|e| e.get(&field));

        let merged = match (strategy, existing, incoming) {
            (
                MergeStrategy::AppendDedupeSort,
                Some(FieldValue::RefList(existing)),
                FieldValue::RefList(incoming),
            ) => FieldValue::RefList(append_dedupe_sort(existing, &incoming, |k| {
                self.created_at(k)
            })),
            (MergeStrategy::AppendDedupeSort, None, FieldValue::RefList(incoming)) => {
                FieldValue::RefList(append_dedupe_sort(&[], &incoming, |k| self.created_at(k)))
            }
            (_, _, incoming) => incoming,
        };

        trace!(entity = %key, field = %field, ?strategy, "merged field");
        self.entities
            .entry(key.clone())
            .or_default()
            .fields
            .insert(field, merged);
    }

    /// Write every scalar of `value` onto `key`; `count_field` becomes a
    /// [`FieldValue::Count`] stored under `aggregate_name`.
    fn write_object<T: Serialize>(
        &mut self,
        policies: &TypePolicies,
        key: &EntityKey,
        value: &T,
        aggregate: Option<(&str, &str)>,
    ) -> bool {
        let object = match serde_json::to_value(value) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                warn!(entity = %key, value = %other, "cannot normalize non-object value");
                return false;
            }
            Err(e) => {
                warn!(entity = %key, error = %e, "failed to normalize entity");
                return false;
            }
        };

        for (name, value) in object {
            let field_value = match aggregate {
                Some((count_field, aggregate_name)) if name == count_field => {
                    let count = value.as_u64().unwrap_or(0);
                    self.write_field(
                        policies,
                        key,
                        aggregate_name.to_string(),
                        FieldValue::Count(count),
                    );
                    continue;
                }
                _ => FieldValue::Scalar(value),
            };
            self.write_field(policies, key, name, field_value);
        }
        true
    }

    fn write_chat(&mut self, policies: &TypePolicies, chat: &Chat) -> EntityKey {
        let key = EntityKey::from(&chat.id);
        self.write_object(
            policies,
            &key,
            chat,
            Some(("message_count", "messages_aggregate")),
        );
        key
    }

    fn write_message(&mut self, policies: &TypePolicies, message: &Message) -> EntityKey {
        let key = EntityKey::from(&message.id);
        self.write_object(policies, &key, message, None);
        key
    }

    fn read<T: DeserializeOwned>(&self, key: &EntityKey, aggregate: Option<(&str, &str)>) -> Option<T> {
        let entity = self.entities.get(key)?;
        let mut object = serde_json::Map::new();
        for (name, value) in &entity.fields {
            match value {
                FieldValue::Scalar(v) => {
                    object.insert(name.clone(), v.clone());
                }
                FieldValue::Count(n) => {
                    if let Some((count_field, aggregate_name)) = aggregate
                        && name == aggregate_name
                    {
                        object.insert(count_field.to_string(), Value::from(*n));
                    }
                }
                FieldValue::Ref(_) | FieldValue::RefList(_) => {}
            }
        }
        serde_json::from_value(Value::Object(object)).ok()
    }

    fn read_chat(&self, key: &EntityKey) -> Option<Chat> {
        self.read(key, Some(("message_count", "messages_aggregate")))
    }

    fn read_message(&self, key: &EntityKey) -> Option<Message> {
        self.read(key, None)
    }

    fn root_refs(&self, field: &str) -> Option<Vec<EntityKey>> {
        match self.entities.get(&EntityKey::root())?.get(field)? {
            FieldValue::RefList(keys) => Some(keys.clone()),
            _ => None,
        }
    }

    fn set_root_field(&mut self, field: String, value: FieldValue) {
        self.entities
            .entry(EntityKey::root())
            .or_default()
            .fields
            .insert(field, value);
    }

    fn remove_unreachable(&mut self) -> Vec<EntityKey> {
        let mut reachable: HashSet<EntityKey> = HashSet::new();
        let mut queue: VecDeque<EntityKey> = VecDeque::new();
        reachable.insert(EntityKey::root());
        queue.push_back(EntityKey::root());

        while let Some(key) = queue.pop_front() {
            let Some(entity) = self.entities.get(&key) else {
                continue;
            };
            for value in entity.fields.values() {
                for target in value.refs() {
                    if reachable.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
            }
        }

        let mut removed: Vec<EntityKey> = self
            .entities
            .keys()
            .filter(|k| !reachable.contains(*k))
            .cloned()
            .collect();
        removed.sort();
        for key in &removed {
            self.entities.remove(key);
        }
        removed
    }
}

/// The normalized client-side store.
pub struct Store {
    inner: Mutex<Inner>,
    policies: TypePolicies,
    events_tx: broadcast::Sender<StoreEvent>,
}

impl Store {
    /// Create an empty store with the default merge policies.
    pub fn new() -> Arc<Self> {
        Self::with_policies(TypePolicies::default())
    }

    pub fn with_policies(policies: TypePolicies) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let mut entities = HashMap::new();
        entities.insert(EntityKey::root(), Entity::default());
        Arc::new(Self {
            inner: Mutex::new(Inner { entities }),
            policies,
            events_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    fn broadcast(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a chat-list result into `chats`.
    pub fn write_chat_list(&self, origin: Origin, chats: &[Chat]) {
        let keys = {
            let mut inner = self.lock();
            let keys: Vec<EntityKey> = chats
                .iter()
                .map(|chat| inner.write_chat(&self.policies, chat))
                .collect();
            inner.write_field(
                &self.policies,
                &EntityKey::root(),
                "chats".to_string(),
                FieldValue::RefList(keys.clone()),
            );
            keys
        };

        debug!(?origin, count = keys.len(), "wrote chat list");
        self.broadcast(StoreEvent::Written { origin, keys });
    }

    /// Write one chat's message list.
    ///
    /// Replaces the chat's `messages` query result and merges the refs into
    /// the chat's own collection. Messages belonging to another chat are
    /// skipped.
    pub fn write_messages(&self, origin: Origin, chat_id: &ChatId, messages: &[Message]) {
        let keys = {
            let mut inner = self.lock();
            let keys: Vec<EntityKey> = messages
                .iter()
                .filter(|m| {
                    let belongs = &m.chat_id == chat_id;
                    if !belongs {
                        warn!(chat_id = %chat_id, message_id = %m.id, "skipping message from another chat");
                    }
                    belongs
                })
                .map(|m| inner.write_message(&self.policies, m))
                .collect();

            let root = EntityKey::root();
            let chat_key = EntityKey::from(chat_id);
            inner.write_field(
                &self.policies,
                &root,
                messages_field(chat_id),
                FieldValue::RefList(keys.clone()),
            );
            inner.write_field(
                &self.policies,
                &chat_key,
                "messages".to_string(),
                FieldValue::RefList(keys.clone()),
            );
            inner.write_field(
                &self.policies,
                &root,
                chat_field(chat_id),
                FieldValue::Ref(chat_key),
            );
            keys
        };

        debug!(?origin, chat_id = %chat_id, count = keys.len(), "wrote messages");
        self.broadcast(StoreEvent::Written { origin, keys });
    }

    /// Write a single-chat query result with its history.
    pub fn write_chat_with_messages(&self, origin: Origin, result: &ChatWithMessages) {
        let keys = {
            let mut inner = self.lock();
            let chat_key = inner.write_chat(&self.policies, &result.chat);
            let message_keys: Vec<EntityKey> = result
                .messages
                .iter()
                .filter(|m| m.chat_id == result.chat.id)
                .map(|m| inner.write_message(&self.policies, m))
                .collect();
            inner.write_field(
                &self.policies,
                &chat_key,
                "messages".to_string(),
                FieldValue::RefList(message_keys.clone()),
            );
            inner.write_field(
                &self.policies,
                &EntityKey::root(),
                chat_field(&result.chat.id),
                FieldValue::Ref(chat_key.clone()),
            );

            let mut keys = vec![chat_key];
            keys.extend(message_keys);
            keys
        };

        debug!(?origin, chat_id = %result.chat.id, "wrote chat with messages");
        self.broadcast(StoreEvent::Written { origin, keys });
    }

    /// Insert a freshly created chat at the head of the chat list with a
    /// zero message count.
    pub fn prepend_chat(&self, chat: &Chat) {
        let key = {
            let mut inner = self.lock();
            let fresh = Chat {
                message_count: 0,
                latest: None,
                ..chat.clone()
            };
            let key = inner.write_chat(&self.policies, &fresh);

            let mut list = vec![key.clone()];
            list.extend(
                inner
                    .root_refs("chats")
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|k| k != &key),
            );
            inner.set_root_field("chats".to_string(), FieldValue::RefList(list));
            key
        };

        debug!(chat_id = %chat.id, "prepended chat");
        self.broadcast(StoreEvent::Written {
            origin: Origin::Local,
            keys: vec![key],
        });
    }

    /// Apply a field-level update to a cached chat.
    ///
    /// Returns `false` without writing when the chat is not cached.
    pub fn modify_chat(&self, chat_id: &ChatId, patch: ChatPatch) -> bool {
        let key = EntityKey::from(chat_id);
        {
            let mut inner = self.lock();
            let Some(mut chat) = inner.read_chat(&key) else {
                return false;
            };

            if let Some(title) = patch.title {
                chat.title = title;
            }
            if let Some(updated_at) = patch.updated_at
                && updated_at > chat.updated_at
            {
                chat.updated_at = updated_at;
            }
            if let Some(count) = patch.message_count {
                chat.message_count = count;
            }
            if let Some(latest) = patch.latest {
                chat.latest = Some(latest);
            }

            inner.write_chat(&self.policies, &chat);
        }

        trace!(chat_id = %chat_id, "modified chat");
        self.broadcast(StoreEvent::Written {
            origin: Origin::Local,
            keys: vec![key],
        });
        true
    }

    /// Add one confirmed message to its chat's cached collections.
    pub fn append_message(&self, message: &Message) {
        let key = {
            let mut inner = self.lock();
            let key = inner.write_message(&self.policies, message);
            let chat_key = EntityKey::from(&message.chat_id);

            inner.write_field(
                &self.policies,
                &chat_key,
                "messages".to_string(),
                FieldValue::RefList(vec![key.clone()]),
            );

            let field = messages_field(&message.chat_id);
            let existing = inner.root_refs(&field).unwrap_or_default();
            let list = append_dedupe_sort(&existing, std::slice::from_ref(&key), |k| {
                inner.created_at(k)
            });
            inner.set_root_field(field, FieldValue::RefList(list));
            key
        };

        debug!(chat_id = %message.chat_id, message_id = %message.id, "appended message");
        self.broadcast(StoreEvent::Written {
            origin: Origin::Local,
            keys: vec![key],
        });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Chats in the cached list order. Dangling references are skipped.
    pub fn chat_list(&self) -> Vec<Chat> {
        let inner = self.lock();
        inner
            .root_refs("chats")
            .unwrap_or_default()
            .iter()
            .filter_map(|k| inner.read_chat(k))
            .collect()
    }

    /// Whether a chat list has been written.
    pub fn has_chat_list(&self) -> bool {
        self.lock().root_refs("chats").is_some()
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<Chat> {
        self.lock().read_chat(&EntityKey::from(chat_id))
    }

    /// Confirmed messages of a chat, oldest first.
    ///
    /// Reads the chat's own collection, which accumulates every fetch, feed
    /// snapshot and local append. The `messages` query result is only used
    /// when no collection exists.
    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        let inner = self.lock();
        let collection = match inner
            .entities
            .get(&EntityKey::from(chat_id))
            .and_then(|chat| chat.get("messages"))
        {
            Some(FieldValue::RefList(keys)) => Some(keys.clone()),
            _ => None,
        };
        collection
            .or_else(|| inner.root_refs(&messages_field(chat_id)))
            .unwrap_or_default()
            .iter()
            .filter_map(|k| inner.read_message(k))
            .collect()
    }

    /// Whether a message list for this chat has been written.
    pub fn has_messages(&self, chat_id: &ChatId) -> bool {
        self.lock().root_refs(&messages_field(chat_id)).is_some()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.lock().entities.contains_key(key)
    }

    /// A copy of one entity.
    pub fn entity(&self, key: &EntityKey) -> Option<Entity> {
        self.lock().entities.get(key).cloned()
    }

    /// Copy of every entity, root included, in key order.
    pub fn dump(&self) -> BTreeMap<EntityKey, Entity> {
        self.lock()
            .entities
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of normalized entities, not counting the root.
    pub fn entity_count(&self) -> usize {
        self.lock().entities.len().saturating_sub(1)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Remove one entity. The root is never removed.
    pub fn evict(&self, key: &EntityKey) -> bool {
        if key.is_root() {
            return false;
        }
        let removed = self.lock().entities.remove(key).is_some();
        if removed {
            debug!(entity = %key, "evicted entity");
            self.broadcast(StoreEvent::EntityEvicted { key: key.clone() });
        }
        removed
    }

    /// Remove every field with this base name from every entity, including
    /// argument-qualified root fields. Returns how many fields were removed.
    pub fn evict_field(&self, name: &str) -> usize {
        let removed = {
            let mut inner = self.lock();
            let mut removed = 0;
            for entity in inner.entities.values_mut() {
                let before = entity.fields.len();
                entity.fields.retain(|k, _| field_base_name(k) != name);
                removed += before - entity.fields.len();
            }
            removed
        };
        if removed > 0 {
            debug!(field = name, removed, "evicted field");
            self.broadcast(StoreEvent::FieldEvicted {
                field: name.to_string(),
                removed,
            });
        }
        removed
    }

    /// Drop every entity not reachable from the root. Returns the removed
    /// keys in sorted order.
    pub fn gc(&self) -> Vec<EntityKey> {
        let removed = self.lock().remove_unreachable();
        if !removed.is_empty() {
            debug!(removed = removed.len(), "collected unreachable entities");
            self.broadcast(StoreEvent::Collected {
                removed: removed.clone(),
            });
        }
        removed
    }

    pub fn evict_chat(&self, chat_id: &ChatId) -> bool {
        self.evict(&EntityKey::from(chat_id))
    }

    pub fn evict_message(&self, message_id: &MessageId) -> bool {
        self.evict(&EntityKey::from(message_id))
    }

    /// Drop all cached query results and everything only they referenced.
    pub fn clear_chat_data(&self) -> Vec<EntityKey> {
        self.evict_field("chats");
        self.evict_field("messages");
        self.evict_field("chat");
        self.gc()
    }
}
