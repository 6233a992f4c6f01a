//! Echo server demo exercising all four call shapes.
//!
//! Run it and poke it with any gRPC client that can send raw bytes, e.g.
//! grpcurl with a string-shaped proto. Messages are plain UTF-8 strings so
//! the demo stays independent of any message schema.

use bytes::Bytes;
use tonbo_grpc::prelude::*;

fn decode(raw: Bytes) -> Result<String, Status> {
    String::from_utf8(raw.to_vec()).map_err(|_| Status::internal("request is not utf-8"))
}

fn encode(value: &String) -> Result<Bytes, Status> {
    Ok(Bytes::from(value.clone()))
}

fn echo_service() -> ServiceDefinition {
    ServiceDefinition::new()
        .unary(
            "/echo.EchoService/Echo",
            decode,
            encode,
            |call: UnaryContext<String>| async move { Ok(Reply::new(call.into_request())) },
        )
        .server_streaming(
            "/echo.EchoService/Repeat",
            decode,
            encode,
            |call: UnaryContext<String>, sink: ResponseSink<String>| async move {
                for i in 1..=3 {
                    if sink.cancelled() {
                        break;
                    }
                    sink.send(&format!("{} ({}/3)", call.request(), i)).await?;
                }
                Ok(())
            },
        )
        .client_streaming(
            "/echo.EchoService/Collect",
            decode,
            encode,
            |mut stream: RequestStream<String>| async move {
                let mut collected = Vec::new();
                while let Some(item) = stream.next().await {
                    collected.push(item?);
                }
                Ok(Reply::new(collected.join("\n")))
            },
        )
        .duplex(
            "/echo.EchoService/Chat",
            decode,
            encode,
            |mut stream: RequestStream<String>, sink: ResponseSink<String>| async move {
                while let Some(item) = stream.next().await {
                    sink.send(&format!("you said: {}", item?)).await?;
                }
                let mut bye = Metadata::new();
                bye.set("chat-over", "true").map_err(|_| Status::internal("bad trailer"))?;
                sink.end(Some(bye));
                Ok(())
            },
        )
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt::init();

    let options = ServerOptions::default().max_receive_message_length(Some(1 << 20));
    let server = Server::new(options);
    server.add_service(echo_service())?;

    let port = server.bind("127.0.0.1:50051", None).await?;
    server.start()?;
    println!("echo server listening on port {}", port);

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    server.try_shutdown().await;
    Ok(())
}
