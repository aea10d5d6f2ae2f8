//! End-to-end pipeline tests over the core trio: a message appended to
//! the store flows through the router and lands on the right agents'
//! trigger queues, with the loop guard bounding agent-to-agent chains.

use std::{path::Path, sync::Arc};

use chattr_core::{
    config::DefaultRouting,
    queue::{TriggerQueueReader, TriggerQueueWriter},
    router::{RouteDecision, Router},
    store::{Store, StoreEvent},
    types::{MessageKind, NewMessage, PinStatus},
};

/// Wire a store to a router and per-agent queues the way the hub does:
/// an observer that routes every stored chat message and appends the loop
/// guard notice as a system message.
fn wire(dir: &Path, agents: &[&str], max_hops: u32) -> (Arc<Store>, Arc<Router>) {
    let store = Arc::new(Store::open(dir).unwrap());
    let names: Vec<String> = agents.iter().map(|a| a.to_string()).collect();
    let router = Arc::new(Router::new(&names, DefaultRouting::None, max_hops));

    let writers: Vec<(String, TriggerQueueWriter)> = agents
        .iter()
        .map(|a| (a.to_string(), TriggerQueueWriter::new(dir, a)))
        .collect();

    let store_for_observer = store.clone();
    let router_for_observer = router.clone();
    store.on_event(move |event| {
        let StoreEvent::Message(msg) = event else {
            return;
        };
        if msg.kind != MessageKind::Message || msg.sender == "system" {
            return;
        }
        match router_for_observer.route(&msg.sender, &msg.text, &msg.channel) {
            RouteDecision::Deliver(targets) => {
                for target in targets {
                    if !router_for_observer.should_enqueue(&target, &msg.channel, msg.id) {
                        continue;
                    }
                    if let Some((_, writer)) = writers.iter().find(|(name, _)| *name == target) {
                        writer.push(&msg.channel, Some(msg.id)).unwrap();
                    }
                }
            }
            RouteDecision::Paused { notice: Some(notice) } => {
                store_for_observer
                    .append(
                        NewMessage::new("system", notice)
                            .in_channel(&msg.channel)
                            .with_kind(MessageKind::System),
                    )
                    .unwrap();
            }
            RouteDecision::Paused { notice: None } => {}
        }
    });

    (store, router)
}

fn post(store: &Store, sender: &str, text: &str, channel: &str) {
    store
        .append(NewMessage::new(sender, text).in_channel(channel))
        .unwrap();
}

fn queue_entries(dir: &Path, agent: &str) -> Vec<chattr_core::types::TriggerEntry> {
    TriggerQueueReader::new(dir, agent).poll().unwrap().entries
}

#[test]
fn single_mention_wakes_exactly_one_agent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, router) = wire(dir.path(), &["claude", "codex", "gemini"], 4);

    post(&store, "user", "@claude ping", "general");

    let claude = queue_entries(dir.path(), "claude");
    assert_eq!(claude.len(), 1);
    assert_eq!(claude[0].channel, "general");
    assert_eq!(claude[0].message_id, Some(0));
    assert!(queue_entries(dir.path(), "codex").is_empty());
    assert!(queue_entries(dir.path(), "gemini").is_empty());
    // Human sender: the hop counter stays at zero.
    assert_eq!(router.hops("general"), 0);
}

#[test]
fn two_hop_chain_pauses_then_continue_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let (store, router) = wire(dir.path(), &["claude", "codex"], 2);

    store.create_channel("dev").unwrap();
    post(&store, "user", "@claude hi", "dev");
    post(&store, "claude", "@codex over to you", "dev");
    post(&store, "codex", "@claude done", "dev");
    // Third agent hop: dropped, one system notice.
    post(&store, "claude", "@codex once more", "dev");

    assert!(router.is_paused("dev"));
    let notices: Vec<_> = store
        .recent(Some("dev"), 50)
        .into_iter()
        .filter(|m| m.sender == "system")
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(
        notices[0].text,
        "Loop guard paused #dev — type /continue to resume"
    );

    // The dropped hop enqueued nothing new.
    assert_eq!(queue_entries(dir.path(), "codex").len(), 1);
    assert_eq!(queue_entries(dir.path(), "claude").len(), 2);

    // A second capped message does not repeat the notice.
    post(&store, "codex", "@claude hello?", "dev");
    let notices = store
        .recent(Some("dev"), 50)
        .into_iter()
        .filter(|m| m.sender == "system")
        .count();
    assert_eq!(notices, 1);

    router.continue_routing("dev");
    assert_eq!(router.hops("dev"), 0);
    post(&store, "claude", "@codex resumed", "dev");
    assert_eq!(queue_entries(dir.path(), "codex").len(), 2);
}

#[test]
fn prefix_mention_resolves_to_configured_agent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _router) = wire(dir.path(), &["claude", "codex", "gemini"], 4);

    post(&store, "user", "@gemini-cli see this", "general");

    assert_eq!(queue_entries(dir.path(), "gemini").len(), 1);
    assert!(queue_entries(dir.path(), "claude").is_empty());
}

#[test]
fn zero_hops_pauses_on_first_agent_message() {
    let dir = tempfile::tempdir().unwrap();
    let (store, router) = wire(dir.path(), &["claude", "codex"], 0);

    post(&store, "claude", "@codex hi", "general");

    assert!(router.is_paused("general"));
    assert!(queue_entries(dir.path(), "codex").is_empty());
}

#[test]
fn pin_lifecycle_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _router) = wire(dir.path(), &["claude"], 4);
    for _ in 0..8 {
        post(&store, "user", "filler", "general");
    }

    store.set_pin(7, Some(PinStatus::Todo)).unwrap();
    assert_eq!(
        store.pins().into_iter().collect::<Vec<_>>(),
        vec![(7, PinStatus::Todo)]
    );

    store.set_pin(7, Some(PinStatus::Done)).unwrap();
    assert_eq!(
        store.pins().into_iter().collect::<Vec<_>>(),
        vec![(7, PinStatus::Done)]
    );

    store.set_pin(7, None).unwrap();
    assert!(store.pins().is_empty());

    // Deleting a pinned message removes the pin implicitly.
    store.set_pin(7, Some(PinStatus::Todo)).unwrap();
    store.delete(&[7]).unwrap();
    assert!(store.pins().is_empty());
}

#[test]
fn deleted_messages_never_reach_cursor_readers() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _router) = wire(dir.path(), &["claude"], 4);
    for i in 0..6 {
        post(&store, "user", &format!("m{i}"), "general");
    }
    store.delete(&[2, 4]).unwrap();

    let ids: Vec<u64> = store.since(0, None).iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![0, 1, 3, 5]);
}
