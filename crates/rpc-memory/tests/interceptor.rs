mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use parking_lot::Mutex;
use proven_rpc::interceptor::CallObserver;
use proven_rpc::{CallInfo, CallOptions, Error, Message, StreamShape};

type Events = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: &'static str,
    events: Events,
}

impl Recorder {
    fn push(&self, hook: &str) {
        self.events.lock().push(format!("{}:{hook}", self.name));
    }
}

impl CallObserver for Recorder {
    fn on_open(&self, _info: &CallInfo) {
        self.push("on_open");
    }

    fn before_send(&self, _info: &CallInfo, _message: &Bytes) {
        self.push("before_send");
    }

    fn after_send(&self, _info: &CallInfo, _result: &proven_rpc::Result<()>) {
        self.push("after_send");
    }

    fn before_receive(&self, _info: &CallInfo) {
        self.push("before_receive");
    }

    fn after_receive(&self, _info: &CallInfo, result: &proven_rpc::Result<Option<Bytes>>) {
        match result {
            Ok(Some(_)) => self.push("after_receive"),
            Ok(None) => self.push("after_receive_end"),
            Err(_) => self.push("after_receive_error"),
        }
    }

    fn before_unary(&self, _info: &CallInfo, _request: &Bytes) {
        self.push("before_unary");
    }

    fn after_unary(&self, _info: &CallInfo, result: Result<&Bytes, &Error>) {
        match result {
            Ok(_) => self.push("after_unary"),
            Err(_) => self.push("after_unary_error"),
        }
    }
}

const LEVELS: [&str; 3] = ["a", "b", "c"];

/// Events for `hook` in the order an onion of `LEVELS` produces them.
fn around(before: &str, after: &str) -> Vec<String> {
    let mut events: Vec<_> = LEVELS.iter().map(|level| format!("{level}:{before}")).collect();
    events.extend(LEVELS.iter().rev().map(|level| format!("{level}:{after}")));
    events
}

fn count(events: &Events, hook: &str) -> usize {
    events
        .lock()
        .iter()
        .filter(|event| event.split_once(':').is_some_and(|(_, name)| name == hook))
        .count()
}

fn observed_client(server: &ServerHandle, events: &Events) -> proven_rpc::Client {
    LEVELS
        .into_iter()
        .fold(
            proven_rpc::Client::builder(server.connect()),
            |builder, name| {
                builder.observer(Recorder {
                    name,
                    events: Arc::clone(events),
                })
            },
        )
        .build()
}

fn observed_greeter(events: &Events) -> proven_rpc::Server {
    LEVELS
        .into_iter()
        .fold(greeter(), |builder, name| {
            builder.observer(Recorder {
                name,
                events: Arc::clone(events),
            })
        })
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_unary_wraps_in_registration_order() {
    let server = spawn_server(greeter().build());
    let events = Events::default();
    let client = observed_client(&server, &events);

    client
        .unary::<_, HelloResponse>(HELLO, HelloRequest::new("gopher"), CallOptions::new())
        .await
        .unwrap();

    assert_eq!(*events.lock(), around("before_unary", "after_unary"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_stream_operations_are_each_wrapped() {
    let server = spawn_server(greeter().build());
    let events = Events::default();
    let client = observed_client(&server, &events);

    let stream = client
        .open(HELLO_BI_STREAMS, StreamShape::Bidirectional, CallOptions::new())
        .await
        .unwrap();
    // The innermost wrapper sees the opened stream first.
    assert_eq!(*events.lock(), ["c:on_open", "b:on_open", "a:on_open"]);

    for name in ["alice", "bob"] {
        events.lock().clear();
        stream
            .send(HelloRequest::new(name).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(*events.lock(), around("before_send", "after_send"));

        events.lock().clear();
        let response = stream.receive().await.unwrap().unwrap();
        assert_eq!(
            HelloResponse::decode(response).unwrap().message,
            format!("Hello, {name}!")
        );
        assert_eq!(*events.lock(), around("before_receive", "after_receive"));
    }

    events.lock().clear();
    stream.close_send().await.unwrap();
    assert_eq!(stream.receive().await, Ok(None));
    assert_eq!(
        *events.lock(),
        around("before_receive", "after_receive_end")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_unary_sees_only_unary_events() {
    let events = Events::default();
    let server = spawn_server(observed_greeter(&events));
    let client = proven_rpc::Client::new(server.connect());

    client
        .unary::<_, HelloResponse>(HELLO, HelloRequest::new("gopher"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(*events.lock(), around("before_unary", "after_unary"));

    events.lock().clear();
    client
        .unary::<_, HelloResponse>(HELLO, HelloRequest::new(""), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(*events.lock(), around("before_unary", "after_unary_error"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_stream_operations_are_each_wrapped() {
    let events = Events::default();
    let server = spawn_server(observed_greeter(&events));
    let client = proven_rpc::Client::new(server.connect());

    let summary = client
        .bidi_streaming(
            HELLO_BI_STREAMS,
            tokio_stream::iter(["alice", "bob"].map(HelloRequest::new)),
            CallOptions::new(),
            |_: HelloResponse| {},
        )
        .await
        .unwrap();
    assert_eq!(summary.received, 2);

    // The handler has returned before the trailer reaches the client.
    assert_eq!(count(&events, "on_open"), 3);
    assert_eq!(count(&events, "before_receive"), 9);
    assert_eq!(count(&events, "after_receive"), 6);
    assert_eq!(count(&events, "after_receive_end"), 3);
    assert_eq!(count(&events, "before_send"), 6);
    assert_eq!(count(&events, "after_send"), 6);
    assert_eq!(count(&events, "before_unary"), 0);

    let opens: Vec<_> = events.lock().iter().take(3).cloned().collect();
    assert_eq!(opens, ["a:on_open", "b:on_open", "c:on_open"]);
}
