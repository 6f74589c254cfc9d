use super::*;
use crate::filter::EventFilter;
use crate::message::EventType;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn channel() -> (Arc<Channel>, UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Channel::new("public", tx), rx)
}

fn message(event_type: EventType) -> Message {
    let payload = match json!({"id": 1}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    Message {
        event_type,
        schema: "public".to_string(),
        table: "messages".to_string(),
        payload,
        commit_timestamp: None,
        received_at: Utc::now(),
    }
}

#[test]
fn test_new_channel_is_unjoined() {
    let (chan, _rx) = channel();
    assert_eq!(chan.state(), ChannelState::Unjoined);
    assert!(!chan.is_joined());
}

#[test]
fn test_is_joined_only_in_joined_state() {
    for (state, expected) in [
        (ChannelState::Joining, false),
        (ChannelState::Joined, true),
    ] {
        let (chan, _rx) = channel();
        chan.set_state(state, None);
        assert_eq!(chan.is_joined(), expected, "state {}", state);
    }

    // Terminal states read false as well
    let (chan, _rx) = channel();
    chan.set_state(ChannelState::Joined, None);
    chan.set_state(ChannelState::Closed, None);
    assert!(!chan.is_joined());
}

#[test]
fn test_subscribe_sends_join_command() {
    let (chan, mut rx) = channel();
    chan.subscribe(|_, _| {});
    match rx.try_recv() {
        Ok(Command::Join { topic }) => assert_eq!(topic, "public"),
        other => panic!("expected join command, got {:?}", other),
    }
}

#[test]
fn test_unsubscribe_sends_leave_command() {
    let (chan, mut rx) = channel();
    chan.unsubscribe();
    match rx.try_recv() {
        Ok(Command::Leave { topic }) => assert_eq!(topic, "public"),
        other => panic!("expected leave command, got {:?}", other),
    }
}

#[test]
fn test_state_callbacks_observe_transitions() {
    let (chan, _rx) = channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    chan.subscribe(move |state, _| seen_cb.lock().unwrap().push(state));

    chan.set_state(ChannelState::Joining, None);
    chan.set_state(ChannelState::Joined, None);
    chan.set_state(ChannelState::Closed, None);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ChannelState::Joining,
            ChannelState::Joined,
            ChannelState::Closed
        ]
    );
}

#[test]
fn test_terminal_state_is_sticky() {
    let (chan, _rx) = channel();
    chan.set_state(
        ChannelState::Errored,
        Some(ChannelError::JoinRejected("no".to_string())),
    );
    chan.set_state(ChannelState::Joined, None);
    assert_eq!(chan.state(), ChannelState::Errored);
}

#[test]
fn test_error_observer_fires_at_most_once() {
    let (chan, _rx) = channel();
    let count = Arc::new(Mutex::new(0u32));
    let count_cb = Arc::clone(&count);
    chan.on_error(move |_| *count_cb.lock().unwrap() += 1);

    chan.set_state(ChannelState::TimedOut, Some(ChannelError::JoinTimeout));
    chan.set_state(ChannelState::TimedOut, Some(ChannelError::JoinTimeout));
    chan.set_state(ChannelState::Closed, None);

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn test_close_observer_fires_on_closed() {
    let (chan, _rx) = channel();
    let closed = Arc::new(Mutex::new(false));
    let closed_cb = Arc::clone(&closed);
    chan.on_close(move || *closed_cb.lock().unwrap() = true);

    chan.set_state(ChannelState::Joined, None);
    chan.set_state(ChannelState::Closed, None);
    assert!(*closed.lock().unwrap());
}

#[test]
fn test_deliver_requires_joined_state() {
    let (chan, _rx) = channel();
    let hits = Arc::new(Mutex::new(0u32));
    let hits_cb = Arc::clone(&hits);
    chan.on(Filter::event(EventFilter::All), move |_| {
        *hits_cb.lock().unwrap() += 1
    });

    chan.deliver(&message(EventType::Insert));
    assert_eq!(*hits.lock().unwrap(), 0);

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Insert));
    assert_eq!(*hits.lock().unwrap(), 1);

    chan.set_state(ChannelState::Closed, None);
    chan.deliver(&message(EventType::Insert));
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn test_callbacks_fire_in_registration_order() {
    let (chan, _rx) = channel();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second", "third"] {
        let order_cb = Arc::clone(&order);
        chan.on(Filter::event(EventFilter::All), move |_| {
            order_cb.lock().unwrap().push(tag)
        });
    }

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Update));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_filter_narrows_delivery() {
    let (chan, _rx) = channel();
    let inserts = Arc::new(Mutex::new(0u32));
    let deletes = Arc::new(Mutex::new(0u32));

    let inserts_cb = Arc::clone(&inserts);
    chan.on(Filter::event(EventFilter::Insert), move |_| {
        *inserts_cb.lock().unwrap() += 1
    });
    let deletes_cb = Arc::clone(&deletes);
    chan.on(Filter::event(EventFilter::Delete), move |_| {
        *deletes_cb.lock().unwrap() += 1
    });

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Insert));
    chan.deliver(&message(EventType::Update));
    chan.deliver(&message(EventType::Insert));

    assert_eq!(*inserts.lock().unwrap(), 2);
    assert_eq!(*deletes.lock().unwrap(), 0);
}

#[test]
fn test_panicking_callback_does_not_abort_delivery() {
    let (chan, _rx) = channel();
    let hits = Arc::new(Mutex::new(0u32));

    chan.on(Filter::event(EventFilter::All), |_| {
        panic!("subscriber bug")
    });
    let hits_cb = Arc::clone(&hits);
    chan.on(Filter::event(EventFilter::All), move |_| {
        *hits_cb.lock().unwrap() += 1
    });

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Insert));
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn test_malformed_filter_drops_frame_for_that_binding_only() {
    let (chan, _rx) = channel();
    let hits = Arc::new(Mutex::new(0u32));

    // Empty column name fails evaluation; the frame is dropped for this
    // binding and the next binding still fires.
    chan.on(Filter::event(EventFilter::All).eq("", json!(1)), |_| {
        panic!("must not fire")
    });
    let hits_cb = Arc::clone(&hits);
    chan.on(Filter::event(EventFilter::All), move |_| {
        *hits_cb.lock().unwrap() += 1
    });

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Insert));
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn test_registration_during_delivery_is_safe() {
    let (chan, _rx) = channel();
    let chan_cb = Arc::clone(&chan);
    // Re-registering from inside a callback must not deadlock; snapshot
    // semantics mean the new binding applies from the next frame on.
    chan.on(Filter::event(EventFilter::All), move |_| {
        chan_cb.on(Filter::event(EventFilter::All), |_| {});
    });

    chan.set_state(ChannelState::Joined, None);
    chan.deliver(&message(EventType::Insert));
    assert_eq!(chan.bindings.read().unwrap().len(), 2);
}
