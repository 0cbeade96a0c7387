//! Property-based tests for the merge policy, retry policy and eviction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use parley_backend::{Chat, ChatId, Message, MessageId};
use parley_sync::store::{EntityKey, FieldValue, append_dedupe_sort};
use parley_sync::{ConnectionState, Origin, RetryPolicy, Store, classify, retry_delay};
use proptest::prelude::*;

const POOL: usize = 12;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

// Strategy for a per-id timestamp table shared by every batch in a case
fn timestamps() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..40, POOL)
}

// Strategy for a batch of distinct message indices into the pool
fn batch() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::hash_set(0..POOL, 0..POOL).prop_map(|s| s.into_iter().collect())
}

fn messages(chat: &str, indices: &[usize], times: &[i64]) -> Vec<Message> {
    indices
        .iter()
        .map(|&i| Message {
            id: MessageId::from(format!("m{}", i)),
            chat_id: ChatId::from(chat),
            content: format!("message {}", i),
            is_bot: i % 2 == 1,
            created_at: at(times[i]),
        })
        .collect()
}

fn chat(id: &str, updated: i64) -> Chat {
    Chat {
        id: ChatId::from(id),
        title: format!("chat {}", id),
        created_at: at(0),
        updated_at: at(updated),
        message_count: 0,
        latest: None,
    }
}

fn collection(store: &Store, chat: &str) -> Vec<EntityKey> {
    match store
        .entity(&EntityKey::chat(chat))
        .and_then(|e| e.get("messages").cloned())
    {
        Some(FieldValue::RefList(keys)) => keys,
        _ => Vec::new(),
    }
}

proptest! {
    #[test]
    fn append_dedupe_sort_has_no_duplicates_and_is_ordered(
        times in timestamps(),
        existing in batch(),
        incoming in prop::collection::vec(0..POOL, 0..20),
    ) {
        let key = |i: usize| EntityKey::message(format!("m{}", i));
        let table: HashMap<EntityKey, DateTime<Utc>> =
            (0..POOL).map(|i| (key(i), at(times[i]))).collect();

        // Existing lists are always the output of an earlier merge
        let existing = append_dedupe_sort(
            &[],
            &existing.into_iter().map(key).collect::<Vec<_>>(),
            |k| table.get(k).copied(),
        );
        let incoming: Vec<EntityKey> = incoming.into_iter().map(key).collect();

        let merged = append_dedupe_sort(&existing, &incoming, |k| table.get(k).copied());

        let unique: HashSet<&EntityKey> = merged.iter().collect();
        prop_assert_eq!(unique.len(), merged.len());

        for pair in merged.windows(2) {
            prop_assert!(table[&pair[0]] <= table[&pair[1]]);
        }

        let expected: HashSet<&EntityKey> = existing.iter().chain(incoming.iter()).collect();
        prop_assert_eq!(unique, expected);
    }

    #[test]
    fn fetch_then_feed_collection_is_deduplicated_and_sorted(
        times in timestamps(),
        fetched in batch(),
        pushed in batch(),
    ) {
        let store = Store::new();
        let chat_id = ChatId::from("c1");

        store.write_messages(Origin::Fetch, &chat_id, &messages("c1", &fetched, &times));
        store.write_messages(Origin::Feed, &chat_id, &messages("c1", &pushed, &times));

        let keys = collection(&store, "c1");
        let unique: HashSet<&EntityKey> = keys.iter().collect();
        prop_assert_eq!(unique.len(), keys.len());
        prop_assert_eq!(keys.len(), fetched.iter().chain(pushed.iter()).collect::<HashSet<_>>().len());

        let index = |k: &EntityKey| k.id[1..].parse::<usize>().unwrap();
        for pair in keys.windows(2) {
            prop_assert!(times[index(&pair[0])] <= times[index(&pair[1])]);
        }

        // What the chat shows is the merged collection, whatever arrived last
        let shown: Vec<EntityKey> = store
            .messages(&chat_id)
            .into_iter()
            .map(|m| EntityKey::from(&m.id))
            .collect();
        prop_assert_eq!(shown, keys);
    }

    #[test]
    fn eviction_and_gc_are_idempotent(
        times in timestamps(),
        fetched in batch(),
        pushed in batch(),
        chats in prop::collection::vec(0i64..100, 1..5),
        evicted in prop::sample::select(vec!["chats", "messages", "chat", "title"]),
    ) {
        let store = Store::new();
        let list: Vec<Chat> = chats
            .iter()
            .enumerate()
            .map(|(i, &updated)| chat(&format!("c{}", i), updated))
            .collect();
        store.write_chat_list(Origin::Fetch, &list);
        store.write_messages(Origin::Fetch, &ChatId::from("c0"), &messages("c0", &fetched, &times));
        store.write_messages(Origin::Feed, &ChatId::from("c9"), &messages("c9", &pushed, &times));

        store.evict_field(evicted);
        let once = store.dump();
        prop_assert_eq!(store.evict_field(evicted), 0);
        prop_assert_eq!(&store.dump(), &once);

        store.gc();
        let collected = store.dump();
        prop_assert!(store.gc().is_empty());
        prop_assert_eq!(store.dump(), collected);
    }

    #[test]
    fn retry_delay_is_monotone_and_capped(
        base in 1u64..10_000,
        multiplier in 1.0f64..4.0,
        extra in 0u64..100_000,
        a in 0u32..200,
        b in 0u32..200,
    ) {
        let max = base + extra;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let d_lo = retry_delay(lo, base, multiplier, max);
        let d_hi = retry_delay(hi, base, multiplier, max);

        prop_assert!(d_lo <= d_hi);
        prop_assert!(d_hi <= max);
        prop_assert_eq!(retry_delay(1, base, multiplier, max), base);
    }

    #[test]
    fn policy_delay_matches_function(attempt in 1u32..50) {
        let policy = RetryPolicy::default();
        prop_assert_eq!(
            policy.delay(attempt).as_millis() as u64,
            retry_delay(attempt, 1000, 2.0, 30_000)
        );
    }

    #[test]
    fn error_always_wins(loading in any::<bool>(), has_data in any::<bool>()) {
        prop_assert_eq!(classify(loading, Some(&"lost"), has_data), ConnectionState::Error);
    }
}
