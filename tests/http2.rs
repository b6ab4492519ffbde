mod support;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier::{
    Body, Method, NoopListener, Request, RequestContext, StatusCode, TransportConfig,
    Transceiver, Version,
};
use support::server;
use tokio::io::AsyncWriteExt;

fn h2_transport() -> Transceiver {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = TransportConfig::builder().http2_prior_knowledge(true).build();
    Transceiver::new(config)
}

#[tokio::test]
async fn prior_knowledge_round_trip() {
    let server = server::h2_server(|_idx, _req, mut respond| async move {
        let response = http::Response::builder().status(200).body(()).unwrap();
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from_static(b"over h2"), true).unwrap();
    });

    let transport = h2_transport();
    let response = transport
        .send(Request::new(Method::GET, server.uri("/")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.body().as_ref(), b"over h2");
}

#[tokio::test]
async fn request_body_is_streamed_per_stream() {
    let server = server::h2_server(|_idx, req, mut respond| async move {
        let mut body = req.into_body();
        let mut received = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.unwrap();
            let _ = body.flow_control().release_capacity(chunk.len());
            received.extend_from_slice(&chunk);
        }

        let response = http::Response::builder().status(200).body(()).unwrap();
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from(received), true).unwrap();
    });

    let transport = h2_transport();
    let request =
        Request::new(Method::POST, server.uri("/echo")).body(Body::full("sent over one stream"));
    let response = transport.send(request).await.unwrap();

    assert_eq!(response.body().as_ref(), b"sent over one stream");
}

#[tokio::test]
async fn rst_stream_fails_only_its_own_request() {
    let server = server::h2_server(|idx, _req, mut respond| async move {
        match idx {
            // Warm-up request, completes immediately.
            0 => {
                let response = http::Response::builder().status(200).body(()).unwrap();
                let mut send = respond.send_response(response, false).unwrap();
                send.send_data(Bytes::from_static(b"warm"), true).unwrap();
            }
            // First concurrent stream: reset quickly.
            1 => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                respond.send_reset(h2::Reason::REFUSED_STREAM);
            }
            // Sibling stream on the same connection: completes after the
            // reset already happened.
            _ => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let response = http::Response::builder().status(200).body(()).unwrap();
                let mut send = respond.send_response(response, false).unwrap();
                send.send_data(Bytes::from_static(b"sibling ok"), true).unwrap();
            }
        }
    });

    let transport = h2_transport();

    // Warm the pool so the two concurrent requests multiplex over the one
    // pooled connection.
    transport
        .send(Request::new(Method::GET, server.uri("/warm")))
        .await
        .unwrap();

    let reset_transport = transport.clone();
    let reset_uri = server.uri("/reset-me");
    let reset = tokio::spawn(async move {
        reset_transport
            .send(Request::new(Method::GET, reset_uri))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sibling = transport
        .send(Request::new(Method::GET, server.uri("/sibling")))
        .await
        .unwrap();
    assert_eq!(sibling.body().as_ref(), b"sibling ok");

    let err = reset.await.unwrap().unwrap_err();
    assert!(err.is_connect());

    // All three exchanges multiplexed over a single connection.
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn stream_timeout_leaves_siblings_and_connection_usable() {
    let server = server::h2_server(|idx, _req, mut respond| async move {
        if idx == 1 {
            // Never answer this stream.
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
        let response = http::Response::builder().status(200).body(()).unwrap();
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from_static(b"fine"), true).unwrap();
    });

    let transport = h2_transport();
    transport
        .send(Request::new(Method::GET, server.uri("/warm")))
        .await
        .unwrap();

    let ctx = RequestContext::new().read_timeout(Duration::from_millis(150));
    let err = transport
        .handle(
            Request::new(Method::GET, server.uri("/stuck")),
            ctx,
            Arc::new(NoopListener),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The connection survived the per-stream timeout.
    let after = transport
        .send(Request::new(Method::GET, server.uri("/after")))
        .await
        .unwrap();
    assert_eq!(after.body().as_ref(), b"fine");
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn trailers_are_delivered_once_before_end() {
    let server = server::h2_server(|_idx, _req, mut respond| async move {
        let response = http::Response::builder().status(200).body(()).unwrap();
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from_static(b"body"), false).unwrap();

        let mut trailers = http::HeaderMap::new();
        trailers.insert("x-digest", "abc123".parse().unwrap());
        send.send_trailers(trailers).unwrap();
    });

    let transport = h2_transport();
    let response = transport
        .send(Request::new(Method::GET, server.uri("/")))
        .await
        .unwrap();

    assert_eq!(response.body().as_ref(), b"body");
    assert_eq!(
        response.trailers().unwrap().get("x-digest").unwrap(),
        "abc123"
    );
}

#[tokio::test]
async fn content_length_enforcement_applies_per_stream() {
    let server = server::h2_server(|_idx, _req, mut respond| async move {
        let response = http::Response::builder()
            .status(200)
            .header("content-length", "100000")
            .body(())
            .unwrap();
        let _ = respond.send_response(response, false);
    });

    let config = TransportConfig::builder()
        .http2_prior_knowledge(true)
        .max_content_length(16)
        .build();
    let transport = Transceiver::new(config);

    let err = transport
        .send(Request::new(Method::GET, server.uri("/")))
        .await
        .unwrap_err();
    assert!(err.is_content_over_sized());
}

#[tokio::test]
async fn h2c_upgrade_replays_request_as_first_stream() {
    let server = server::raw(|listener| async move {
        // First connection: the HTTP/1.1 upgrade probe.
        let (mut probe, _) = listener.accept().await.unwrap();
        let head = server::read_http_head(&mut probe).await.unwrap();
        assert!(server::head_contains(&head, "upgrade: h2c"));
        assert!(server::head_contains(&head, "http2-settings"));
        probe
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
            )
            .await
            .unwrap();
        drop(probe);

        // Second connection: the replay, speaking h2 with prior knowledge.
        let (replay, _) = listener.accept().await.unwrap();
        let mut conn = h2::server::handshake(replay).await.unwrap();
        while let Some(Ok((_req, mut respond))) = conn.accept().await {
            let response = http::Response::builder().status(200).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from_static(b"upgraded"), true).unwrap();
        }
    });

    let _ = env_logger::builder().is_test(true).try_init();
    let config = TransportConfig::builder().h2c_upgrade(true).build();
    let transport = Transceiver::new(config);

    let response = transport
        .send(Request::new(Method::GET, server.uri("/")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.body().as_ref(), b"upgraded");
}

#[tokio::test]
async fn h2c_probe_refused_continues_as_http1() {
    let server = server::scripted(|head, socket| {
        Box::new(async move {
            assert!(server::head_contains(head, "upgrade: h2c"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain")
                .await
                .unwrap();
        })
    });

    let _ = env_logger::builder().is_test(true).try_init();
    let config = TransportConfig::builder().h2c_upgrade(true).build();
    let transport = Transceiver::new(config);

    let response = transport
        .send(Request::new(Method::GET, server.uri("/")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(response.body().as_ref(), b"plain");
}
