mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::*;
use proven_rpc::server::HandlerResult;
use proven_rpc::{
    CallOptions, ClientStream, Context, Message, Metadata, Responses, Server, StreamShape,
};
use tokio::sync::Notify;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_header_not_available_before_first_message() {
    let gate = Arc::new(Notify::new());
    let server = spawn_server(
        Server::builder()
            .server_streaming(HELLO_SERVER_STREAM, {
                let gate = Arc::clone(&gate);
                move |ctx: Context, request: HelloRequest, responses: Responses<HelloResponse>| {
                    let gate = Arc::clone(&gate);
                    async move {
                        ctx.set_header(Metadata::from([("name", request.name.as_str())]))?;
                        gate.notified().await;
                        responses.send(HelloResponse::new("first")).await?;
                        HandlerResult::Ok(())
                    }
                }
            })
            .build(),
    );
    let client = proven_rpc::Client::new(server.connect());

    for name in ["first-call", "second-call"] {
        let mut streaming = client
            .server_streaming::<_, HelloResponse>(
                HELLO_SERVER_STREAM,
                HelloRequest::new(name),
                CallOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(streaming.header(), None);
        assert_eq!(streaming.trailer(), None);

        gate.notify_one();
        assert!(streaming.message().await.unwrap().is_some());

        // Never a value left over from the previous call.
        let header = streaming.header().unwrap();
        assert_eq!(header.get("name"), Some(name));
        assert_eq!(streaming.await_header().await.unwrap(), header);
        assert_eq!(streaming.await_header().await.unwrap(), header);

        assert!(streaming.message().await.unwrap().is_none());
        assert_eq!(streaming.trailer(), Some(Metadata::new()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_header_sent_explicitly_arrives_before_any_message() {
    let (client, _server) = start_greeter();

    // The greeter flushes its header as soon as the call starts.
    let stream = client
        .open(HELLO_BI_STREAMS, StreamShape::Bidirectional, CallOptions::new())
        .await
        .unwrap();

    let header = stream.await_header().await.unwrap();
    assert_eq!(header, server_metadata("stream", "header"));
    assert_eq!(stream.trailer(), None);

    stream.close_send().await.unwrap();
    assert_eq!(stream.receive().await, Ok(None));
    assert_eq!(stream.trailer(), Some(server_metadata("stream", "trailer")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_set_twice_is_rejected() {
    let server = spawn_server(
        Server::builder()
            .unary(HELLO, |ctx: Context, _request: HelloRequest| async move {
                ctx.set_header(Metadata::from([("attempt", "1")]))?;
                let header = ctx.set_header(Metadata::from([("attempt", "2")]));
                ctx.set_trailer(Metadata::from([("attempt", "1")]))?;
                let trailer = ctx.set_trailer(Metadata::from([("attempt", "2")]));
                HandlerResult::Ok(HelloResponse::new(format!(
                    "{} / {}",
                    header.unwrap_err(),
                    trailer.unwrap_err()
                )))
            })
            .build(),
    );
    let client = proven_rpc::Client::new(server.connect());

    let response = client
        .unary::<_, HelloResponse>(HELLO, HelloRequest::new("twice"), CallOptions::new())
        .await
        .unwrap();

    assert_eq!(
        response.message.message,
        "Header metadata has already been set / Trailer metadata has already been set"
    );
    assert_eq!(response.header.get("attempt"), Some("1"));
    assert_eq!(response.trailer.get("attempt"), Some("1"));
}

fn large_trailer() -> Metadata {
    (0..16)
        .map(|i| (format!("key-{i}"), format!("value-{i}")))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trailer_reads_never_race_with_receive() {
    let server = spawn_server(
        Server::builder()
            .server_streaming(
                HELLO_SERVER_STREAM,
                |ctx: Context, request: HelloRequest, responses: Responses<HelloResponse>| async move {
                    ctx.set_trailer(large_trailer())?;
                    for i in 0..request.count {
                        responses.send(HelloResponse::new(i.to_string())).await?;
                    }
                    HandlerResult::Ok(())
                },
            )
            .build(),
    );
    let client = proven_rpc::Client::new(server.connect());
    let expected = large_trailer();

    for _ in 0..20 {
        let stream: Arc<dyn ClientStream> = Arc::from(
            client
                .open(HELLO_SERVER_STREAM, StreamShape::ServerStreaming, CallOptions::new())
                .await
                .unwrap(),
        );
        stream
            .send(HelloRequest::with_count("stress", 200).encode().unwrap())
            .await
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let poller = tokio::spawn({
            let stream = Arc::clone(&stream);
            let done = Arc::clone(&done);
            let expected = expected.clone();
            async move {
                let mut observed = 0;
                while !done.load(Ordering::Acquire) {
                    if let Some(trailer) = stream.trailer() {
                        assert_eq!(trailer, expected);
                        observed += 1;
                    }
                    tokio::task::yield_now().await;
                }
                observed
            }
        });

        let mut received = 0;
        while stream.receive().await.unwrap().is_some() {
            received += 1;
        }
        assert_eq!(received, 200);
        assert_eq!(stream.trailer(), Some(expected.clone()));

        done.store(true, Ordering::Release);
        poller.await.unwrap();
    }
}
