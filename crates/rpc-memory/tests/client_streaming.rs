mod common;

use std::time::Duration;

use common::*;
use futures::StreamExt;
use proven_rpc::{CallOptions, Code, Error, Status};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_sees_all_requests_in_order() {
    let (client, _server) = start_greeter();

    let names = ["alice", "bob", "carol", "dave"];
    let requests = tokio_stream::iter(names.map(HelloRequest::new));
    let response = client
        .client_streaming::<_, HelloResponse, _>(
            HELLO_CLIENT_STREAM,
            requests,
            CallOptions::new().with_metadata(client_metadata("client-stream")),
        )
        .await
        .unwrap();

    assert_eq!(response.message.message, "Hello ,[alice bob carol dave]!");
    assert_eq!(response.header, proven_rpc::Metadata::new());
    assert_eq!(
        response.trailer,
        server_metadata("client-stream", "trailer")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_request_stream() {
    let (client, _server) = start_greeter();

    let response = client
        .client_streaming::<_, HelloResponse, _>(
            HELLO_CLIENT_STREAM,
            tokio_stream::empty::<HelloRequest>(),
            CallOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.message.message, "Hello ,[]!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_paced_requests() {
    let (client, _server) = start_greeter();

    let (tx, rx) = mpsc::channel(1);
    let producer = tokio::spawn(async move {
        for i in 0..20 {
            tx.send(HelloRequest::new(format!("n{i}"))).await.unwrap();
            if i % 5 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    let response = client
        .client_streaming::<_, HelloResponse, _>(
            HELLO_CLIENT_STREAM,
            ReceiverStream::new(rx),
            CallOptions::new(),
        )
        .await
        .unwrap();
    producer.await.unwrap();

    let expected: Vec<_> = (0..20).map(|i| format!("n{i}")).collect();
    assert_eq!(
        response.message.message,
        format!("Hello ,[{}]!", expected.join(" "))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_early_handler_failure_wins_over_send_errors() {
    let server = spawn_server(
        proven_rpc::Server::builder()
            .client_streaming(
                HELLO_CLIENT_STREAM,
                |_ctx: proven_rpc::Context, _requests: proven_rpc::Requests<HelloRequest>| async move {
                    Err::<HelloResponse, _>(Status::new(Code::ResourceExhausted, "quota"))
                },
            )
            .build(),
    );
    let client = proven_rpc::Client::new(server.connect());

    let requests = tokio_stream::iter(0..500).map(|i| HelloRequest::new(format!("n{i}")));
    let error = client
        .client_streaming::<_, HelloResponse, _>(HELLO_CLIENT_STREAM, requests, CallOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Handler(Status {
            code: Code::ResourceExhausted,
            ..
        })
    ));
}
