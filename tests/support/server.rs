#![allow(dead_code)]

use std::{
    future::Future,
    io, net,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    runtime,
    sync::oneshot,
};

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    accepted: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn uri(&self, path: &str) -> http::Uri {
        format!("http://{}{}", self.addr, path).parse().unwrap()
    }

    /// How many TCP connections the server has accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !::std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

fn spawn_server<F>(serve: F) -> Server
where
    F: FnOnce(
            TcpListener,
            oneshot::Receiver<()>,
            Arc<AtomicUsize>,
        ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + 'static,
{
    // Spawn a fresh runtime in a thread to prevent reactor execution
    // context conflicts with the test's own runtime.
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async {
            TcpListener::bind(&net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_handle = accepted.clone();
        let tname = format!("test({test_name})-support-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(serve(listener, shutdown_rx, accepted_handle));
                let _ = panic_tx.send(());
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            accepted,
            shutdown_tx: Some(shutdown_tx),
        }
    })
    .join()
    .unwrap()
}

/// A scripted HTTP/1.1 server: for every request head read off a
/// connection, the closure gets the raw head bytes and the socket, and
/// writes whatever bytes it wants back.
pub fn scripted<F>(do_response: F) -> Server
where
    for<'c> F: Fn(&'c [u8], &'c mut TcpStream) -> Box<dyn Future<Output = ()> + Send + 'c>
        + Clone
        + Send
        + 'static,
{
    spawn_server(move |listener, mut shutdown_rx, accepted| {
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    accepted_conn = listener.accept() => {
                        let (io, _) = accepted_conn.expect("accepted");
                        accepted.fetch_add(1, Ordering::SeqCst);
                        let do_response = do_response.clone();
                        tokio::spawn(async move {
                            scripted_client(io, do_response).await;
                        });
                    }
                }
            }
        })
    })
}

async fn scripted_client<F>(mut client_socket: TcpStream, do_response: F)
where
    for<'c> F: Fn(&'c [u8], &'c mut TcpStream) -> Box<dyn Future<Output = ()> + Send + 'c>,
{
    loop {
        let request = read_http_head(&mut client_socket)
            .await
            .expect("read_http_head failed");
        if request.is_empty() {
            // connection closed by client
            break;
        }

        Box::into_pin(do_response(&request, &mut client_socket)).await;
    }
}

/// Reads bytes until the "\r\n\r\n" delimiter, returning the head.
pub async fn read_http_head(client_socket: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();

    // Read one byte at a time so we stop exactly at the end of the head and
    // never consume body bytes that arrived coalesced with it — those must be
    // left on the socket for the response script to read.
    loop {
        let mut byte = [0u8; 1];
        let n = client_socket.read(&mut byte).await?;

        if n == 0 {
            break;
        }

        buf.push(byte[0]);

        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
    }

    Ok(buf)
}

/// Pulls the content-length value out of raw head bytes.
pub fn content_length_of(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n") {
        let mut parts = line.splitn(2, ':');
        let name = parts.next()?.trim();
        if name.eq_ignore_ascii_case("content-length") {
            return parts.next()?.trim().parse().ok();
        }
    }
    None
}

/// Decodes a chunked request body off the socket, including the terminating
/// zero chunk and its trailing CRLF.
pub async fn read_chunked_body(socket: &mut TcpStream) -> Vec<u8> {
    async fn read_line(socket: &mut TcpStream) -> String {
        let mut line = Vec::new();
        loop {
            let b = socket.read_u8().await.expect("chunk line byte");
            if b == b'\n' {
                break;
            }
            if b != b'\r' {
                line.push(b);
            }
        }
        String::from_utf8(line).expect("chunk line utf8")
    }

    let mut body = Vec::new();
    loop {
        let line = read_line(socket).await;
        let size = usize::from_str_radix(line.split(';').next().unwrap().trim(), 16)
            .expect("chunk size");
        if size == 0 {
            // Trailer section: lines until the blank one.
            loop {
                if read_line(socket).await.is_empty() {
                    break;
                }
            }
            return body;
        }
        let mut chunk = vec![0u8; size];
        socket.read_exact(&mut chunk).await.expect("chunk data");
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        socket.read_exact(&mut crlf).await.expect("chunk crlf");
        assert_eq!(&crlf, b"\r\n");
    }
}

pub fn head_contains(head: &[u8], needle: &str) -> bool {
    std::str::from_utf8(head)
        .map(|text| text.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
        .unwrap_or(false)
}

/// An HTTP/2 (prior knowledge) server. The handler is spawned per stream,
/// with the index of the stream on its connection (0, 1, 2, …) in arrival
/// order.
pub fn h2_server<F, Fut>(handler: F) -> Server
where
    F: Fn(usize, http::Request<h2::RecvStream>, h2::server::SendResponse<bytes::Bytes>) -> Fut
        + Clone
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_server(move |listener, mut shutdown_rx, accepted| {
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    accepted_conn = listener.accept() => {
                        let (io, _) = accepted_conn.expect("accepted");
                        accepted.fetch_add(1, Ordering::SeqCst);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let mut conn = match h2::server::handshake(io).await {
                                Ok(conn) => conn,
                                Err(_) => return,
                            };
                            let mut index = 0;
                            while let Some(result) = conn.accept().await {
                                let (request, respond) = match result {
                                    Ok(pair) => pair,
                                    Err(_) => break,
                                };
                                let handler = handler.clone();
                                let stream_index = index;
                                index += 1;
                                tokio::spawn(handler(stream_index, request, respond));
                            }
                        });
                    }
                }
            }
        })
    })
}

/// A fully custom server: the closure owns the listener and the whole
/// accept loop.
pub fn raw<F, Fut>(serve: F) -> Server
where
    F: FnOnce(TcpListener) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_server(move |listener, mut shutdown_rx, _accepted| {
        Box::pin(async move {
            tokio::select! {
                _ = &mut shutdown_rx => {}
                _ = serve(listener) => {}
            }
        })
    })
}
