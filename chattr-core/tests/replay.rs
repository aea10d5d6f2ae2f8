//! Log replay round-trips: every record kind the store writes must
//! rebuild the same in-memory state on the next open.

use chattr_core::{
    store::Store,
    types::{Attachment, DecisionStatus, MessageKind, NewMessage, PinStatus},
};

#[test]
fn full_state_survives_replay() {
    let dir = tempfile::tempdir().unwrap();

    let (messages, pins, decisions, channels, settings) = {
        let store = Store::open(dir.path()).unwrap();
        store.create_channel("dev").unwrap();
        store.create_channel("scratch").unwrap();

        store
            .append(NewMessage::new("user", "plain message"))
            .unwrap();
        store
            .append(
                NewMessage::new("claude", "with extras")
                    .in_channel("dev")
                    .with_kind(MessageKind::Message),
            )
            .unwrap();
        let mut rich = NewMessage::new("codex", "reply with attachment").in_channel("dev");
        rich.reply_to = Some(1);
        rich.attachments.push(Attachment {
            path: Some("/tmp/uploads/ab12.png".into()),
            name: "shot.png".into(),
            url: "/uploads/ab12.png".into(),
        });
        store.append(rich).unwrap();
        store
            .append(
                NewMessage::new("gemini", "gemini connected").with_kind(MessageKind::Join),
            )
            .unwrap();

        store.set_pin(1, Some(PinStatus::Todo)).unwrap();
        store.set_pin(2, Some(PinStatus::Done)).unwrap();

        let d0 = store
            .propose_decision("prefer jsonl logs", "user", Some("replayable"))
            .unwrap();
        store
            .set_decision_status(d0.id, DecisionStatus::Approved)
            .unwrap();
        store.propose_decision("cap channels at 8", "claude", None).unwrap();

        let mut settings = store.settings();
        settings.title = "replay room".into();
        settings.max_agent_hops = 3;
        settings.history_limit = "200".into();
        store.update_settings(settings).unwrap();

        // Destructive records too: delete a message, rename and drop
        // channels.
        store.delete(&[0]).unwrap();
        store.rename_channel("dev", "dev-main").unwrap();
        store.delete_channel("scratch").unwrap();

        (
            store.recent(None, 100),
            store.pins(),
            store.decisions(),
            store.channels(),
            store.settings(),
        )
    };

    let reopened = Store::open(dir.path()).unwrap();
    assert_eq!(reopened.recent(None, 100), messages);
    assert_eq!(reopened.pins(), pins);
    assert_eq!(reopened.decisions(), decisions);
    assert_eq!(reopened.channels(), channels);
    assert_eq!(reopened.settings(), settings);

    // Ids keep counting from where they left off.
    let next = reopened.append(NewMessage::new("user", "after replay")).unwrap();
    assert_eq!(next.id, 4);
}

#[test]
fn rename_round_trip_is_identity_across_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::open(dir.path()).unwrap();
        store.create_channel("x").unwrap();
        store
            .append(NewMessage::new("user", "hello").in_channel("x"))
            .unwrap();
        store.rename_channel("x", "y").unwrap();
        store.rename_channel("y", "x").unwrap();
    }
    let reopened = Store::open(dir.path()).unwrap();
    let messages = reopened.recent(None, 10);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].channel, "x");
    assert_eq!(reopened.channels(), vec!["general", "x"]);
}
