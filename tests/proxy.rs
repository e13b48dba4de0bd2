mod common;

use common::{config, get, start, Client};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread;
use xserve::config::WorkerMode;
use xserve::handler::AppHandler;
use xserve::http::parser::find_head_end;
use xserve::proxy::ProxyHandler;

/// A backend that answers one request per connection with `reply`
fn backend(reply: &'static [u8], connections: usize) -> (SocketAddr, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            while find_head_end(&buf).is_none() {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            seen.push(String::from_utf8_lossy(&buf).into_owned());
            stream.write_all(reply).unwrap();
        }
        seen
    });
    (addr, handle)
}

#[test]
fn test_chunked_backend_relayed() {
    let (backend_addr, backend) = backend(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Backend: yes\r\nConnection: close\r\n\r\n\
          6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
        1,
    );
    let server = start(
        config(WorkerMode::Thread),
        AppHandler::from_sync(ProxyHandler::new(backend_addr)),
    );
    let mut client = Client::connect(server.local_addr());

    let reply = client.request(&get("/api?x=1"));
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "hello world");
    assert_eq!(reply.header("X-Backend"), Some("yes"));
    // Hop-by-hop headers are the server's own, not the backend's
    assert_eq!(reply.header("Connection"), Some("keep-alive"));

    let seen = backend.join().unwrap();
    assert!(seen[0].starts_with("GET /api?x=1 HTTP/1.1\r\n"));
}

#[test]
fn test_content_length_backend_relayed_per_request() {
    let (backend_addr, backend) = backend(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok", 2);
    let server = start(
        config(WorkerMode::Async),
        AppHandler::from_sync(ProxyHandler::new(backend_addr)),
    );
    let mut client = Client::connect(server.local_addr());

    for path in ["/first", "/second"] {
        let reply = client.request(&get(path));
        assert_eq!(reply.status, 201);
        assert_eq!(reply.text(), "ok");
    }
    let seen = backend.join().unwrap();
    assert!(seen[1].starts_with("GET /second "));
    drop(client);
    server.shutdown();
}

#[test]
fn test_unreachable_backend_is_502() {
    let unused = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = unused.local_addr().unwrap();
    drop(unused);

    let server = start(
        config(WorkerMode::Thread),
        AppHandler::from_sync(ProxyHandler::new(backend_addr)),
    );
    let mut client = Client::connect(server.local_addr());
    assert_eq!(client.request(&get("/")).status, 502);
}
