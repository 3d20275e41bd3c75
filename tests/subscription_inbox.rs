use mama_bridge::ffi::{self, NativeHandle};
use mama_bridge::loopback;
use mama_bridge::Bridge::{
    Bridge, BridgeBuilder, Inbox, InboxHandler, Message, Publisher, Queue, Subscription, SubscriptionHandler,
    SubscriptionState, Transport, TransportEvent, TransportTopicEvent,
};
use mama_bridge::Core::{BridgeError, Closure, NativeWrapper, Ownership, Status};
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn bridge() -> Bridge {
    let bridge = BridgeBuilder::new().with_name("subscription-tests").build(loopback::api());
    // Hand back whatever an earlier test left with the engine, then start clean
    bridge.shutdown();
    loopback::reset();
    bridge
}

fn drain(queue: &Queue) {
    queue.timed_dispatch(Duration::from_millis(3)).unwrap();
}

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SubscriptionHandler for Journal {
    fn on_create(&self, subscription: &Subscription, _closure: &Closure) {
        self.record(format!("create {}", subscription.requested_topic()));
    }

    fn on_error(&self, _subscription: &Subscription, status: Status, _closure: &Closure) {
        self.record(format!("error {}", status.as_str()));
    }

    fn on_msg(&self, _subscription: &Subscription, msg: &Message, closure: &Closure) {
        let tag = closure.as_ref().and_then(|c| c.downcast_ref::<&str>()).copied().unwrap_or("-");
        let value = msg.get_i32(Some("value"), 1).unwrap_or(-1);
        self.record(format!("msg {} {}", tag, value));
    }

    fn on_destroy(&self, _subscription: &Subscription, _closure: &Closure) {
        self.record("destroy".to_string());
    }
}

impl InboxHandler for Journal {
    fn on_msg(&self, _inbox: &Inbox, reply: &Message, _closure: &Closure) {
        let answer = reply.get_string(Some("answer"), 2).unwrap_or_default();
        self.record(format!("reply {}", answer));
    }

    fn on_error(&self, _inbox: &Inbox, status: Status, _closure: &Closure) {
        self.record(format!("inbox error {}", status.as_str()));
    }

    fn on_destroy(&self, _inbox: &Inbox, _closure: &Closure) {
        self.record("inbox destroy".to_string());
    }
}

fn message_with(bridge: &Bridge, value: i32) -> Message {
    let msg = Message::new(bridge).unwrap();
    msg.add_i32(Some("value"), 1, value).unwrap();
    msg
}

#[test]
#[serial]
fn subscription_lifecycle() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let journal = Arc::new(Journal::default());

    let subscription =
        Subscription::create(&transport, &queue, journal.clone(), "MD.IBM", Some(Arc::new("ibm"))).unwrap();
    assert_eq!(subscription.state().unwrap(), SubscriptionState::Creating);
    assert_eq!(subscription.topic().unwrap(), "MD.IBM");
    assert!(journal.events().is_empty(), "nothing runs before dispatch");

    drain(&queue);
    assert_eq!(subscription.state().unwrap(), SubscriptionState::Activated);

    let publisher = Publisher::create(&transport, "MD.IBM", None, None).unwrap();
    publisher.send(&message_with(&bridge, 10)).unwrap();
    publisher.send(&message_with(&bridge, 11)).unwrap();
    drain(&queue);

    assert!(loopback::inject_subscription_error(
        subscription.native_handle().unwrap(),
        Status::NotEntitled.code()
    ));

    subscription.destroy().unwrap();
    assert!(subscription.is_registered());
    // Sent after the destroy request; never delivered
    publisher.send(&message_with(&bridge, 12)).unwrap();
    drain(&queue);
    assert!(!subscription.is_registered());

    assert_eq!(
        journal.events(),
        vec![
            "create MD.IBM".to_string(),
            "msg ibm 10".to_string(),
            "msg ibm 11".to_string(),
            "error NOT_ENTITLED".to_string(),
            "destroy".to_string(),
        ]
    );
    publisher.destroy().unwrap();
    queue.destroy_wait().unwrap();
    assert_eq!(loopback::counters().double_destroys, 0);
}

#[test]
#[serial]
fn dropping_subscription_wrapper_still_notifies() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let journal = Arc::new(Journal::default());

    let subscription = Subscription::create(&transport, &queue, journal.clone(), "MD.X", None).unwrap();
    let handle = subscription.native_handle().unwrap();
    drop(subscription);

    // The create notification was already queued, but the subscription is
    // now being destroyed, so only the destroy is seen
    drain(&queue);
    assert_eq!(journal.events(), vec!["destroy".to_string()]);
    assert!(!loopback::inject_subscription_error(handle, Status::Timeout.code()));
    assert_eq!(bridge.pending_callbacks(), 0);
    queue.destroy().unwrap();
}

#[test]
#[serial]
fn empty_topic_is_rejected_without_registration() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let result = Subscription::create(&transport, &queue, Arc::new(Journal::default()), "", None);
    assert!(matches!(result, Err(BridgeError::InvalidArgument(_))));
    assert_eq!(bridge.pending_callbacks(), 0);
    assert!(queue.can_destroy().unwrap());
}

struct Responder {
    publisher: Publisher,
    bridge: Bridge,
    failures: Mutex<Vec<BridgeError>>,
}

impl SubscriptionHandler for Responder {
    fn on_msg(&self, _subscription: &Subscription, request: &Message, _closure: &Closure) {
        let answer = request.get_i32(Some("value"), 1).map(|v| format!("pong {}", v));
        let result = answer.and_then(|answer| {
            let reply = Message::new(&self.bridge)?;
            reply.add_string(Some("answer"), 2, &answer)?;
            self.publisher.send_reply_to_inbox(request, &reply)
        });
        if let Err(e) = result {
            self.failures.lock().unwrap().push(e);
        }
    }
}

#[test]
#[serial]
fn request_reply_through_inbox() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();

    let responder = Arc::new(Responder {
        publisher: Publisher::create(&transport, "SVC.REPLY", None, None).unwrap(),
        bridge: bridge.clone(),
        failures: Mutex::new(Vec::new()),
    });
    let service = Subscription::create(&transport, &queue, responder.clone(), "SVC.PING", None).unwrap();

    let journal = Arc::new(Journal::default());
    let inbox = Inbox::create(&transport, &queue, journal.clone(), None).unwrap();
    let requests = Publisher::create(&transport, "SVC.PING", None, None).unwrap();

    requests.send_from_inbox(&inbox, &message_with(&bridge, 1)).unwrap();
    requests.send_from_inbox(&inbox, &message_with(&bridge, 2)).unwrap();
    drain(&queue);

    assert!(responder.failures.lock().unwrap().is_empty());
    assert_eq!(journal.events(), vec!["reply pong 1".to_string(), "reply pong 2".to_string()]);

    // A request without a reply address cannot be answered
    let plain = message_with(&bridge, 3);
    assert_eq!(
        responder.publisher.send_reply_to_inbox(&plain, &plain),
        Err(BridgeError::Native(Status::InvalidArg))
    );

    inbox.destroy().unwrap();
    service.destroy().unwrap();
    drain(&queue);
    assert!(!inbox.is_registered());
    assert_eq!(journal.events().last().map(String::as_str), Some("inbox destroy"));
    queue.destroy().unwrap();
}

#[test]
#[serial]
fn request_without_subscribers_reports_on_inbox() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let journal = Arc::new(Journal::default());
    let inbox = Inbox::create(&transport, &queue, journal.clone(), None).unwrap();
    let requests = Publisher::create(&transport, "NOBODY.HOME", None, None).unwrap();

    requests.send_from_inbox(&inbox, &message_with(&bridge, 1)).unwrap();
    assert!(journal.events().is_empty());
    drain(&queue);
    assert_eq!(journal.events(), vec!["inbox error NO_SUBSCRIBERS".to_string()]);

    inbox.destroy().unwrap();
    // Destroying twice is harmless and never reaches the engine again
    inbox.destroy().unwrap();
    queue.destroy_wait().unwrap();
    assert_eq!(journal.events().len(), 2);
    assert_eq!(loopback::counters().double_destroys, 0);
}

#[test]
#[serial]
fn replies_after_inbox_destroy_are_dropped() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let responder = Arc::new(Responder {
        publisher: Publisher::create(&transport, "SVC.REPLY", None, None).unwrap(),
        bridge: bridge.clone(),
        failures: Mutex::new(Vec::new()),
    });
    let service = Subscription::create(&transport, &queue, responder.clone(), "SVC.PING", None).unwrap();
    let journal = Arc::new(Journal::default());
    let inbox = Inbox::create(&transport, &queue, journal.clone(), None).unwrap();
    let requests = Publisher::create(&transport, "SVC.PING", None, None).unwrap();

    requests.send_from_inbox(&inbox, &message_with(&bridge, 5)).unwrap();
    inbox.destroy().unwrap();
    drain(&queue);

    // The service saw the request but its reply found no live inbox
    assert_eq!(
        *responder.failures.lock().unwrap(),
        vec![BridgeError::Native(Status::NotFound)]
    );
    assert_eq!(journal.events(), vec!["inbox destroy".to_string()]);
    service.destroy().unwrap();
    drain(&queue);
    assert_eq!(bridge.pending_callbacks(), 0);
}

#[test]
#[serial]
fn throttled_request_from_inbox_gets_reply() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let responder = Arc::new(Responder {
        publisher: Publisher::create(&transport, "SVC.REPLY", None, None).unwrap(),
        bridge: bridge.clone(),
        failures: Mutex::new(Vec::new()),
    });
    let service = Subscription::create(&transport, &queue, responder.clone(), "SVC.PING", None).unwrap();
    let journal = Arc::new(Journal::default());
    let inbox = Inbox::create(&transport, &queue, journal.clone(), None).unwrap();
    let requests = Publisher::create(&transport, "SVC.PING", None, None).unwrap();

    let completions = Arc::new(Mutex::new(Vec::new()));
    let log = completions.clone();
    let request = message_with(&bridge, 4);
    requests
        .send_from_inbox_with_throttle(&inbox, &request, None, move |_publisher: &Publisher, _msg: &Message, status: Status, _closure: &Closure| {
            log.lock().unwrap().push(status);
        })
        .unwrap();
    assert_eq!(request.ownership(), Ownership::EngineOwned);
    assert_eq!(requests.pending_sends(), 1);
    assert!(journal.events().is_empty());

    drain(&queue);
    assert_eq!(*completions.lock().unwrap(), vec![Status::Ok]);
    assert_eq!(request.ownership(), Ownership::Owned);
    assert_eq!(requests.pending_sends(), 0);
    assert_eq!(journal.events(), vec!["reply pong 4".to_string()]);

    // Replies could never reach an inbox listening on another transport
    let elsewhere = Transport::create(&bridge, "elsewhere").unwrap();
    let foreign = Publisher::create(&elsewhere, "SVC.PING", None, None).unwrap();
    assert_eq!(
        foreign.send_from_inbox(&inbox, &message_with(&bridge, 5)),
        Err(BridgeError::Native(Status::InvalidArg))
    );

    inbox.destroy().unwrap();
    service.destroy().unwrap();
    drain(&queue);
    assert!(responder.failures.lock().unwrap().is_empty());
    assert_eq!(bridge.pending_callbacks(), 0);
    queue.destroy().unwrap();
}

#[derive(Default)]
struct HandleLog {
    seen: Mutex<Vec<(&'static str, Option<NativeHandle>)>>,
}

impl InboxHandler for HandleLog {
    fn on_msg(&self, inbox: &Inbox, _reply: &Message, _closure: &Closure) {
        self.seen.lock().unwrap().push(("reply", inbox.native_handle().ok()));
    }

    fn on_error(&self, inbox: &Inbox, _status: Status, _closure: &Closure) {
        self.seen.lock().unwrap().push(("error", inbox.native_handle().ok()));
    }

    fn on_destroy(&self, inbox: &Inbox, _closure: &Closure) {
        self.seen.lock().unwrap().push(("destroy", inbox.native_handle().ok()));
    }
}

#[test]
#[serial]
fn inbox_callbacks_after_wrapper_drop_carry_the_native_handle() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let log = Arc::new(HandleLog::default());
    let inbox = Inbox::create(&transport, &queue, log.clone(), None).unwrap();
    let handle = inbox.native_handle().unwrap();
    assert_eq!(inbox.bridge().config().name(), "subscription-tests");

    let requests = Publisher::create(&transport, "NOBODY.HOME", None, None).unwrap();
    requests.send_from_inbox(&inbox, &message_with(&bridge, 1)).unwrap();
    drop(inbox);

    drain(&queue);
    assert_eq!(
        *log.seen.lock().unwrap(),
        vec![("error", Some(handle)), ("destroy", Some(handle))]
    );
    assert_eq!(bridge.pending_callbacks(), 0);
    queue.destroy().unwrap();
}

#[test]
#[serial]
fn transport_reports_connection_and_topic_events() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let status_log = log.clone();
    transport
        .set_transport_callback(move |transport: &Transport, event: TransportEvent, cause: i16| {
            let name = transport.name().unwrap_or_default();
            status_log.lock().unwrap().push(format!("{:?} {} {}", event, cause, name));
        })
        .unwrap();
    let topic_log = log.clone();
    transport
        .set_transport_topic_callback(move |_transport: &Transport, event: TransportTopicEvent, topic: &str| {
            topic_log.lock().unwrap().push(format!("{:?} {}", event, topic));
        })
        .unwrap();
    assert_eq!(bridge.pending_callbacks(), 2);

    let handle = transport.native_handle().unwrap();
    assert!(loopback::inject_transport_event(handle, ffi::TRANSPORT_DISCONNECT, 3));
    assert!(loopback::inject_transport_event(handle, ffi::TRANSPORT_RECONNECT, 0));
    let subscription =
        Subscription::create(&transport, &queue, Arc::new(Journal::default()), "MD.TOPIC", None).unwrap();
    subscription.destroy().unwrap();
    drain(&queue);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "Disconnect 3 lb".to_string(),
            "Reconnect 0 lb".to_string(),
            "Subscribed MD.TOPIC".to_string(),
            "Unsubscribed MD.TOPIC".to_string(),
        ]
    );

    transport.clear_transport_callback().unwrap();
    assert!(!loopback::inject_transport_event(handle, ffi::TRANSPORT_CONNECT, 0));
    assert_eq!(bridge.pending_callbacks(), 1);
    transport.destroy().unwrap();
    assert_eq!(bridge.pending_callbacks(), 0);
    assert_eq!(bridge.stray_callbacks(), 0);
    queue.destroy().unwrap();
}

#[test]
#[serial]
fn destroy_wait_blocks_until_subscription_is_destroyed() {
    let bridge = bridge();
    let transport = Transport::create(&bridge, "lb").unwrap();
    let queue = Queue::create(&bridge).unwrap();
    let journal = Arc::new(Journal::default());
    let subscription = Subscription::create(&transport, &queue, journal.clone(), "MD.WAIT", None).unwrap();
    drain(&queue);

    let destroyer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        subscription.destroy().unwrap();
    });
    let started = Instant::now();
    queue.destroy_wait().unwrap();
    let waited = started.elapsed();
    destroyer.join().unwrap();

    assert!(waited >= Duration::from_millis(25), "returned after {:?}", waited);
    assert_eq!(journal.events(), vec!["create MD.WAIT".to_string(), "destroy".to_string()]);
    assert_eq!(bridge.pending_callbacks(), 0);
    assert_eq!(loopback::counters().double_destroys, 0);
    transport.destroy().unwrap();
}
