use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use huddle_live::{
    ActivityItem, ActivityKind, ChangeKind, DeliveryStatus, FeedCache, Filter, JsonMap, MessageStatus,
    PresenceCache, PresenceRecord, PresenceStatus, Record, SubscriptionScope, Table,
};
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn item(user: Uuid, minutes: i64) -> ActivityItem {
    ActivityItem {
        id: Uuid::new_v4(),
        user_id: user,
        actor_id: None,
        kind: ActivityKind::MessageReceived,
        title: "New message".into(),
        description: None,
        metadata: JsonMap::new(),
        related_entity: None,
        read: minutes % 3 == 0,
        priority: (minutes % 4 + 1) as u8,
        created_at: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap() + ChronoDuration::minutes(minutes),
    }
}

fn bench_feed_insert_full(c: &mut Criterion) {
    let user = Uuid::new_v4();
    let mut cache = FeedCache::new(50);
    cache.replace((0..50).map(|m| item(user, m)).collect());
    let mut minute = 50;

    c.bench_function("feed_insert_evict_50", |b| {
        b.iter(|| {
            minute += 1;
            black_box(cache.insert(item(user, minute)));
        })
    });
}

fn bench_feed_replace(c: &mut Criterion) {
    let user = Uuid::new_v4();
    let items: Vec<_> = (0..200).rev().map(|m| item(user, m)).collect();

    c.bench_function("feed_replace_200_to_50", |b| {
        b.iter(|| {
            let mut cache = FeedCache::new(50);
            cache.replace(black_box(items.clone()));
            black_box(cache.unread_count());
        })
    });
}

fn bench_feed_mark_all(c: &mut Criterion) {
    let user = Uuid::new_v4();
    let mut cache = FeedCache::new(50);
    cache.replace((0..50).map(|m| item(user, m)).collect());

    c.bench_function("feed_set_read_rollback_50", |b| {
        b.iter(|| {
            let unread = cache.unread_ids();
            let flipped = cache.set_read(&unread);
            cache.rollback_read(black_box(&flipped));
        })
    });
}

fn bench_online_users(c: &mut Criterion) {
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
    let mut cache = PresenceCache::new();
    for n in 0..1_000i64 {
        let seen = now - ChronoDuration::seconds(n);
        cache.merge(PresenceRecord {
            user_id: Uuid::new_v4(),
            status: if n % 5 == 0 { PresenceStatus::Away } else { PresenceStatus::Online },
            current_activity: None,
            context: JsonMap::new(),
            last_seen: seen,
            updated_at: seen,
        });
    }

    c.bench_function("presence_online_users_1000", |b| {
        b.iter(|| black_box(cache.online_users(black_box(now), Duration::from_secs(90), Duration::from_secs(30))))
    });
}

fn bench_filter_match(c: &mut Criterion) {
    let user = Uuid::new_v4();
    let row = item(user, 7).to_row().unwrap();
    let ids: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
    let filter = Filter::new().eq("user_id", user).is_in("id", ids);

    c.bench_function("filter_eq_in_50", |b| b.iter(|| black_box(filter.matches(black_box(&row)))));
}

fn bench_delivery_merge(c: &mut Criterion) {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let read = MessageStatus {
        message_id: id,
        status: DeliveryStatus::Read,
        delivered_at: Some(now),
        read_at: Some(now),
    };

    c.bench_function("delivery_merge_forward", |b| {
        b.iter(|| {
            let mut status = MessageStatus::sent(id);
            black_box(status.merge(black_box(&read)));
        })
    });
}

fn bench_scope_key(c: &mut Criterion) {
    let scope = SubscriptionScope::new(
        Table::ActivityFeed,
        &[ChangeKind::Update, ChangeKind::Insert],
        Filter::new().eq("user_id", Uuid::new_v4()),
    );

    c.bench_function("subscription_scope_key", |b| b.iter(|| black_box(scope.key())));
}

criterion_group!(
    benches,
    bench_feed_insert_full,
    bench_feed_replace,
    bench_feed_mark_all,
    bench_online_users,
    bench_filter_match,
    bench_delivery_merge,
    bench_scope_key,
);
criterion_main!(benches);
