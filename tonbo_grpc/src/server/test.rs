//! End-to-end tests: a real server on loopback TCP driven by an h2 client.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Request, StatusCode};
use tokio::net::TcpStream;

use crate::codec::{frame_message, MessageFrame, StreamDecoder};
use crate::handlers::{Reply, RequestStream, ResponseSink, UnaryContext};
use crate::metadata::Metadata;
use crate::options::ServerOptions;
use crate::server::Server;
use crate::service::ServiceDefinition;
use crate::status::{decode_message, Code, Status};

// ============================================================================
// String codec fixture
// ============================================================================

fn decode(raw: Bytes) -> Result<String, Status> {
    String::from_utf8(raw.to_vec()).map_err(|_| Status::internal("request is not utf-8"))
}

fn encode(value: &String) -> Result<Bytes, Status> {
    Ok(Bytes::from(value.clone()))
}

/// Serializer with a fixed six-byte header, for exercising the send cap
/// against the serialized size rather than the user value.
fn encode_with_header(value: &String) -> Result<Bytes, Status> {
    let mut buf = BytesMut::with_capacity(6 + value.len());
    buf.extend_from_slice(b"hdr\x00\x00\x00");
    buf.extend_from_slice(value.as_bytes());
    Ok(buf.freeze())
}

fn echo_service() -> ServiceDefinition {
    ServiceDefinition::new()
        .unary("/EchoService/Echo", decode, encode, |call: UnaryContext<String>| async move {
            Ok(Reply::new(call.into_request()))
        })
        .client_streaming(
            "/EchoService/Gather",
            decode,
            encode,
            |mut stream: RequestStream<String>| async move {
                let mut joined = String::new();
                while let Some(item) = stream.next().await {
                    joined.push_str(&item?);
                }
                Ok(Reply::new(joined))
            },
        )
        .server_streaming(
            "/EchoService/Spray",
            decode,
            encode,
            |call: UnaryContext<String>, sink: ResponseSink<String>| async move {
                for i in 0..5 {
                    sink.send(&format!("{}-{}", call.request(), i)).await?;
                }
                Ok(())
            },
        )
}

async fn start_server(service: ServiceDefinition, options: ServerOptions) -> (Server, u16) {
    let server = Server::new(options);
    server.add_service(service).unwrap();
    let port = server.bind("127.0.0.1:0", None).await.unwrap();
    server.start().unwrap();
    (server, port)
}

// ============================================================================
// h2 client plumbing
// ============================================================================

async fn connect(port: u16) -> h2::client::SendRequest<Bytes> {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (send, conn) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    send
}

fn grpc_request(path: &str, extra: &[(&str, &str)]) -> Request<()> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("http://localhost{}", path))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap()
}

struct Outcome {
    http_status: StatusCode,
    headers: HeaderMap,
    frames: Vec<MessageFrame>,
    trailers: Option<HeaderMap>,
}

impl Outcome {
    /// `grpc-status` / `grpc-message` from the trailers, or from the headers
    /// of a trailers-only response.
    fn grpc_status(&self) -> (i32, String) {
        let map = self.trailers.as_ref().unwrap_or(&self.headers);
        let code = map
            .get("grpc-status")
            .expect("response carries grpc-status")
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let message = map
            .get("grpc-message")
            .map(|v| decode_message(v.as_bytes()))
            .unwrap_or_default();
        (code, message)
    }

    fn single_payload(&self) -> Bytes {
        assert_eq!(self.frames.len(), 1, "expected exactly one response message");
        assert!(!self.frames[0].compressed);
        self.frames[0].payload.clone()
    }
}

async fn read_response(response: h2::client::ResponseFuture) -> Outcome {
    let response = response.await.unwrap();
    let http_status = response.status();
    let headers = response.headers().clone();
    let mut body = response.into_body();

    let mut decoder = StreamDecoder::new();
    let mut frames = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        frames.extend(decoder.write(&chunk).unwrap());
    }
    let trailers = body.trailers().await.unwrap();

    Outcome {
        http_status,
        headers,
        frames,
        trailers,
    }
}

/// One full unary exchange.
async fn call_unary(
    client: &mut h2::client::SendRequest<Bytes>,
    path: &str,
    message: &str,
    extra: &[(&str, &str)],
) -> Outcome {
    let mut send = client.clone().ready().await.unwrap();
    let (response, mut stream) = send.send_request(grpc_request(path, extra), false).unwrap();
    stream
        .send_data(frame_message(message.as_bytes(), false), true)
        .unwrap();
    read_response(response).await
}

// ============================================================================
// Scenario tests
// ============================================================================

#[tokio::test]
async fn echo_unary_round_trip() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Echo", "test value 3", &[]).await;

    assert_eq!(outcome.http_status, StatusCode::OK);
    assert_eq!(
        outcome.headers.get("content-type").unwrap(),
        "application/grpc+proto"
    );
    assert_eq!(outcome.headers.get("grpc-encoding").unwrap(), "identity");
    assert_eq!(&outcome.single_payload()[..], b"test value 3");
    let (code, _message) = outcome.grpc_status();
    assert_eq!(code, Code::Ok as i32);
    assert!(outcome.trailers.is_some(), "status travels in real trailers");
}

#[tokio::test]
async fn deadline_fires_before_slow_handler() {
    let service = ServiceDefinition::new().unary(
        "/EchoService/Slow",
        decode,
        encode,
        |call: UnaryContext<String>| async move {
            tokio::time::sleep(Duration::from_millis(2_000)).await;
            Ok(Reply::new(call.into_request()))
        },
    );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let start = tokio::time::Instant::now();
    let outcome = call_unary(
        &mut client,
        "/EchoService/Slow",
        "late",
        &[("grpc-timeout", "100m")],
    )
    .await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::DeadlineExceeded as i32);
    assert_eq!(message, "Deadline exceeded");
    assert!(start.elapsed() < Duration::from_millis(1_500));
}

#[tokio::test]
async fn invalid_deadline_is_out_of_range() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(
        &mut client,
        "/EchoService/Echo",
        "x",
        &[("grpc-timeout", "Infinity")],
    )
    .await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::OutOfRange as i32);
    assert_eq!(message, "Invalid deadline");
}

#[tokio::test]
async fn unknown_method_is_unimplemented_trailers_only() {
    let service = ServiceDefinition::new().unary(
        "/OtherService/Other",
        decode,
        encode,
        |call: UnaryContext<String>| async move { Ok(Reply::new(call.into_request())) },
    );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Echo", "x", &[]).await;

    assert!(outcome.trailers.is_none(), "expected a trailers-only response");
    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::Unimplemented as i32);
    assert_eq!(
        message,
        "The server does not implement the method /EchoService/Echo"
    );
}

#[tokio::test]
async fn bad_content_type_is_http_415_without_trailers() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let client = connect(port).await;

    for content_type in [None, Some("application/not-grpc")] {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("http://localhost/EchoService/Echo");
        if let Some(value) = content_type {
            builder = builder.header("content-type", value);
        }
        let request = builder.body(()).unwrap();

        let mut send = client.clone().ready().await.unwrap();
        let (response, _stream) = send.send_request(request, true).unwrap();
        let outcome = read_response(response).await;

        assert_eq!(outcome.http_status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(outcome.headers.get("grpc-status").is_none());
        assert!(outcome.trailers.is_none());
        assert!(outcome.frames.is_empty());
    }
}

#[tokio::test]
async fn oversized_send_is_resource_exhausted() {
    let service = ServiceDefinition::new().unary(
        "/EchoService/Echo",
        decode,
        encode_with_header,
        |call: UnaryContext<String>| async move { Ok(Reply::new(call.into_request())) },
    );
    let options = ServerOptions::default().max_send_message_length(Some(1));
    let (_server, port) = start_server(service, options).await;
    let mut client = connect(port).await;

    // two message bytes plus the six-byte serializer header
    let outcome = call_unary(&mut client, "/EchoService/Echo", "ab", &[]).await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::ResourceExhausted as i32);
    assert_eq!(message, "Sent message larger than max (8 vs. 1)");
}

#[tokio::test]
async fn oversized_receive_is_resource_exhausted() {
    let options = ServerOptions::default().max_receive_message_length(Some(4));
    let (_server, port) = start_server(echo_service(), options).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Echo", "too long", &[]).await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::ResourceExhausted as i32);
    assert_eq!(message, "Received message larger than max (8 vs. 4)");
}

#[tokio::test]
async fn utf8_error_details_survive_the_wire() {
    let details = "\u{6e2c}\u{8a66}\u{5b57}\u{7b26}\u{4e32}";
    let service = ServiceDefinition::new().unary(
        "/EchoService/Fail",
        decode,
        encode,
        move |_call: UnaryContext<String>| {
            let details = details.to_string();
            async move { Err::<Reply<String>, _>(Status::new(Code::Unknown, details)) }
        },
    );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Fail", "x", &[]).await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::Unknown as i32);
    assert_eq!(message, details);
}

#[tokio::test]
async fn trailer_metadata_rides_success_and_error() {
    let service = ServiceDefinition::new()
        .unary(
            "/EchoService/OkTrailers",
            decode,
            encode,
            |call: UnaryContext<String>| async move {
                let mut md = Metadata::new();
                md.set("trailer-present", "yes").unwrap();
                Ok(Reply::with_trailers(call.into_request(), md))
            },
        )
        .unary(
            "/EchoService/ErrTrailers",
            decode,
            encode,
            |_call: UnaryContext<String>| async move {
                let mut md = Metadata::new();
                md.set("trailer-present", "yes").unwrap();
                Err::<Reply<String>, _>(Status::new(Code::NotFound, "nope").with_metadata(md))
            },
        );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let ok = call_unary(&mut client, "/EchoService/OkTrailers", "x", &[]).await;
    assert_eq!(ok.grpc_status().0, Code::Ok as i32);
    assert_eq!(ok.trailers.unwrap().get("trailer-present").unwrap(), "yes");

    let err = call_unary(&mut client, "/EchoService/ErrTrailers", "x", &[]).await;
    assert_eq!(err.grpc_status().0, Code::NotFound as i32);
    assert_eq!(err.trailers.unwrap().get("trailer-present").unwrap(), "yes");
}

#[tokio::test]
async fn custom_response_headers_precede_data() {
    let service = ServiceDefinition::new().unary(
        "/EchoService/Headers",
        decode,
        encode,
        |call: UnaryContext<String>| async move {
            let mut md = Metadata::new();
            md.set("x-early", "bird").unwrap();
            md.set("x-blob-bin", b"\x01\x02".as_slice()).unwrap();
            call.send_metadata(&md).await?;
            Ok(Reply::new(call.into_request()))
        },
    );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Headers", "x", &[]).await;

    assert_eq!(outcome.headers.get("x-early").unwrap(), "bird");
    assert_eq!(outcome.headers.get("x-blob-bin").unwrap(), "AQI=");
    assert_eq!(outcome.grpc_status().0, Code::Ok as i32);
}

#[tokio::test]
async fn request_metadata_reaches_the_handler() {
    let service = ServiceDefinition::new().unary(
        "/EchoService/Meta",
        decode,
        encode,
        |call: UnaryContext<String>| async move {
            let value = call.metadata().get_text("x-token").unwrap_or("missing").to_string();
            // compression headers never reach user code
            assert!(call.metadata().get("grpc-accept-encoding").is_empty());
            Ok(Reply::new(value))
        },
    );
    let (_server, port) = start_server(service, ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(
        &mut client,
        "/EchoService/Meta",
        "x",
        &[("x-token", "sesame"), ("grpc-accept-encoding", "identity,gzip")],
    )
    .await;

    assert_eq!(&outcome.single_payload()[..], b"sesame");
}

#[tokio::test]
async fn gzip_request_and_response_round_trip() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let mut client = connect(port).await;

    let message = "compress me ".repeat(50);
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(message.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut send = client.clone().ready().await.unwrap();
    let request = grpc_request(
        "/EchoService/Echo",
        &[
            ("grpc-encoding", "gzip"),
            ("grpc-accept-encoding", "identity,deflate,gzip"),
        ],
    );
    let (response, mut stream) = send.send_request(request, false).unwrap();
    stream
        .send_data(frame_message(&compressed, true), true)
        .unwrap();

    let outcome = read_response(response).await;
    assert_eq!(outcome.headers.get("grpc-encoding").unwrap(), "gzip");
    assert_eq!(outcome.frames.len(), 1);
    assert!(outcome.frames[0].compressed, "response reuses the request encoding");

    let mut decoder = flate2::read::GzDecoder::new(&outcome.frames[0].payload[..]);
    let mut plain = String::new();
    decoder.read_to_string(&mut plain).unwrap();
    assert_eq!(plain, message);
    assert_eq!(outcome.grpc_status().0, Code::Ok as i32);
}

#[tokio::test]
async fn unknown_request_encoding_is_unimplemented() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(
        &mut client,
        "/EchoService/Echo",
        "x",
        &[("grpc-encoding", "snappy")],
    )
    .await;

    let (code, message) = outcome.grpc_status();
    assert_eq!(code, Code::Unimplemented as i32);
    assert!(message.contains("snappy"));
}

#[tokio::test]
async fn client_stream_aggregates_in_wire_order() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let client = connect(port).await;

    let mut send = client.clone().ready().await.unwrap();
    let (response, mut stream) = send
        .send_request(grpc_request("/EchoService/Gather", &[]), false)
        .unwrap();
    for part in ["alpha ", "beta ", "gamma"] {
        stream
            .send_data(frame_message(part.as_bytes(), false), false)
            .unwrap();
    }
    stream.send_data(Bytes::new(), true).unwrap();

    let outcome = read_response(response).await;
    assert_eq!(&outcome.single_payload()[..], b"alpha beta gamma");
    assert_eq!(outcome.grpc_status().0, Code::Ok as i32);
}

#[tokio::test]
async fn server_stream_delivers_in_order() {
    let (_server, port) = start_server(echo_service(), ServerOptions::default()).await;
    let mut client = connect(port).await;

    let outcome = call_unary(&mut client, "/EchoService/Spray", "seed", &[]).await;

    let payloads: Vec<String> = outcome
        .frames
        .iter()
        .map(|f| String::from_utf8(f.payload.to_vec()).unwrap())
        .collect();
    assert_eq!(payloads, vec!["seed-0", "seed-1", "seed-2", "seed-3", "seed-4"]);
    assert_eq!(outcome.grpc_status().0, Code::Ok as i32);
}

#[tokio::test]
async fn multiple_ports_serve_independently() {
    let server = Server::new(ServerOptions::default());
    server.add_service(echo_service()).unwrap();
    let port_a = server.bind("127.0.0.1:0", None).await.unwrap();
    let port_b = server.bind("127.0.0.1:0", None).await.unwrap();
    assert_ne!(port_a, port_b);
    server.start().unwrap();

    for port in [port_a, port_b] {
        let mut client = connect(port).await;
        let outcome = call_unary(&mut client, "/EchoService/Echo", "hello", &[]).await;
        assert_eq!(&outcome.single_payload()[..], b"hello");
    }
}

#[tokio::test]
async fn duplicate_registration_fails() {
    let server = Server::new(ServerOptions::default());
    server.add_service(echo_service()).unwrap();
    let err = server.add_service(echo_service()).unwrap_err();
    assert!(matches!(err, crate::error::ServerError::DuplicateMethod(_)));
}

#[tokio::test]
async fn lifecycle_guards_hold() {
    let server = Server::new(ServerOptions::default());
    assert!(matches!(server.start(), Err(crate::error::ServerError::NotBound)));

    server.add_service(echo_service()).unwrap();
    server.bind("127.0.0.1:0", None).await.unwrap();
    server.start().unwrap();
    assert!(matches!(server.start(), Err(crate::error::ServerError::AlreadyStarted)));
    assert!(server.add_service(ServiceDefinition::new()).is_err());
    assert!(server.bind("127.0.0.1:0", None).await.is_err());
}

#[tokio::test]
async fn graceful_shutdown_is_idempotent() {
    let (server, port) = start_server(echo_service(), ServerOptions::default()).await;

    let mut client = connect(port).await;
    let outcome = call_unary(&mut client, "/EchoService/Echo", "bye", &[]).await;
    assert_eq!(outcome.grpc_status().0, Code::Ok as i32);

    tokio::time::timeout(Duration::from_secs(5), server.try_shutdown())
        .await
        .expect("first shutdown completes");
    tokio::time::timeout(Duration::from_secs(5), server.try_shutdown())
        .await
        .expect("second shutdown completes");

    // the listener is gone once the first shutdown resolved
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn force_shutdown_cancels_inflight_bidi() {
    let (probe_tx, mut probe_rx) = tokio::sync::mpsc::unbounded_channel();
    let service = ServiceDefinition::new().duplex(
        "/EchoService/Bidi",
        decode,
        encode,
        move |mut stream: RequestStream<String>, sink: ResponseSink<String>| {
            let probe = probe_tx.clone();
            async move {
                let _ = probe.send(stream.context().cancellation());
                while let Some(item) = stream.next().await {
                    sink.send(&item?).await?;
                }
                Ok(())
            }
        },
    );
    let (server, port) = start_server(service, ServerOptions::default()).await;
    let client = connect(port).await;

    let mut send = client.clone().ready().await.unwrap();
    let (response, mut stream) = send
        .send_request(grpc_request("/EchoService/Bidi", &[]), false)
        .unwrap();
    stream
        .send_data(frame_message(b"ping", false), false)
        .unwrap();

    // wait for the first echo so the call is demonstrably in flight
    let response = response.await.unwrap();
    let mut body = response.into_body();
    let mut decoder = StreamDecoder::new();
    let mut first = None;
    while first.is_none() {
        let chunk = body.data().await.expect("stream open").unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        first = decoder.write(&chunk).unwrap().into_iter().next();
    }
    assert_eq!(&first.unwrap().payload[..], b"ping");

    let mut signal = probe_rx.recv().await.expect("handler started");
    server.force_shutdown();

    let reason = tokio::time::timeout(Duration::from_secs(5), signal.cancelled())
        .await
        .expect("handler observes cancellation");
    assert_eq!(reason.as_str(), "cancelled");

    // the client side observes an aborted stream, not clean trailers
    let aborted = loop {
        match body.data().await {
            Some(Ok(chunk)) => {
                let _ = body.flow_control().release_capacity(chunk.len());
            }
            Some(Err(_)) => break true,
            None => break body.trailers().await.is_err(),
        }
    };
    assert!(aborted, "bidi stream should be torn down without trailers");

    // graceful shutdown after forced shutdown resolves immediately
    tokio::time::timeout(Duration::from_secs(5), server.try_shutdown())
        .await
        .expect("shutdown after force_shutdown completes");
}
