//! Slot keeper integration tests against an in-process server.

mod common;

use std::time::Duration;

use common::{eventually, spawn_server};
use holdfast::SlotClient;

#[tokio::test]
async fn slot_cap_is_enforced_until_a_slot_frees() {
    let (server, config) = spawn_server(Duration::from_secs(5)).await;
    let client = SlotClient::connect(config).await.expect("connect");
    let keeper = client.keeper("render-farm", 2).await;

    let mut first = keeper.slot("slot-1");
    let mut second = keeper.slot("slot-2");
    let mut third = keeper.slot("slot-3");

    assert!(first.acquire().await.expect("acquire"));
    assert!(second.acquire().await.expect("acquire"));
    assert!(!third.acquire().await.expect("acquire"), "object is full");

    let stats = server.slot_stats().expect("slotkeeper enabled");
    assert_eq!(stats.full, 1);

    second.release().await;
    assert!(
        third.acquire().await.expect("acquire"),
        "freed capacity goes to the next acquirer"
    );

    first.release().await;
    third.release().await;
}

#[tokio::test]
async fn workers_share_a_slot_and_occupancy_replicates() {
    let (_server, config) = spawn_server(Duration::from_secs(5)).await;
    let client = SlotClient::connect(config).await.expect("connect");
    let keeper = client.keeper("ingest", 2).await;

    let mut one = keeper.slot("shard-0");
    let mut two = keeper.slot("shard-0");
    assert!(one.acquire().await.expect("acquire"));
    assert!(two.acquire().await.expect("acquire"));

    assert!(
        eventually(Duration::from_secs(2), || async {
            (keeper.slots(), keeper.workers()) == (1, 2)
        })
        .await,
        "two workers share one slot"
    );

    one.release().await;
    assert!(
        eventually(Duration::from_secs(2), || async {
            (keeper.slots(), keeper.workers()) == (1, 1)
        })
        .await,
        "slot stays while a worker remains"
    );

    two.release().await;
    assert!(
        eventually(Duration::from_secs(2), || async {
            (keeper.slots(), keeper.workers()) == (0, 0)
        })
        .await,
        "last release reclaims the slot"
    );
}

#[tokio::test]
async fn recorded_cap_wins_over_later_requests() {
    let (_server, config) = spawn_server(Duration::from_secs(5)).await;
    let client = SlotClient::connect(config).await.expect("connect");

    let keeper = client.keeper("queue", 1).await;
    let mut slot = keeper.slot("slot-1");
    assert!(slot.acquire().await.expect("acquire"));

    // A second keeper asking for a wider cap only earns a warning; the
    // server still enforces the recorded cap.
    let wishful = client.keeper("queue", 5).await;
    assert_eq!(wishful.max_slots(), 1);
    let mut extra = wishful.slot("slot-2");
    assert!(!extra.acquire().await.expect("acquire"));

    slot.release().await;
}

#[tokio::test]
async fn silent_worker_is_released_on_heartbeat_timeout() {
    let (server, config) = spawn_server(Duration::from_millis(300)).await;
    let silent = config.clone().with_ping_interval(Duration::from_secs(600));
    let client = SlotClient::connect(silent).await.expect("connect");
    let keeper = client.keeper("batch", 1).await;

    let mut slot = keeper.slot("slot-1");
    assert!(slot.acquire().await.expect("acquire"));

    assert!(
        eventually(Duration::from_secs(3), || async {
            server.slot_stats().expect("slotkeeper enabled").timeout == 1
        })
        .await,
        "silent worker must time out"
    );
    assert!(
        eventually(Duration::from_secs(2), || async {
            (keeper.slots(), keeper.workers()) == (0, 0)
        })
        .await,
        "timed-out worker frees its slot"
    );

    // Capacity is available again.
    let lively = SlotClient::connect(config).await.expect("connect");
    let keeper = lively.keeper("batch", 1).await;
    let mut slot = keeper.slot("slot-2");
    assert!(slot.acquire().await.expect("acquire"));
    slot.release().await;
}

#[tokio::test]
async fn idle_errors_once_the_hold_is_gone() {
    let (_server, config) = spawn_server(Duration::from_millis(300)).await;
    let silent = config.with_ping_interval(Duration::from_secs(600));
    let client = SlotClient::connect(silent).await.expect("connect");
    let keeper = client.keeper("solo", 0).await;

    let mut slot = keeper.slot("slot-1");
    assert!(slot.acquire().await.expect("acquire"));

    // The server drops the hold after the heartbeat lapses; the next
    // idle observes the closed stream.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(slot.idle().await.is_err());
}

#[tokio::test]
async fn acquire_counters_track_outcomes() {
    let (server, config) = spawn_server(Duration::from_secs(5)).await;
    let client = SlotClient::connect(config).await.expect("connect");
    let keeper = client.keeper("metrics", 1).await;

    let mut a = keeper.slot("slot-1");
    let mut b = keeper.slot("slot-2");
    assert!(a.acquire().await.expect("acquire"));
    assert!(!b.acquire().await.expect("acquire"));
    a.release().await;

    assert!(
        eventually(Duration::from_secs(2), || async {
            let stats = server.slot_stats().expect("slotkeeper enabled");
            stats.acquired == 1
                && stats.full == 1
                && stats.released == 1
                && stats.created_slots == 1
                && stats.created_workers == 1
                && stats.empty == 1
        })
        .await,
        "counters reflect one grant, one denial, one release"
    );
}
