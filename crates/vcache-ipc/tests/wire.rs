//! Client/codec tests against a scripted peer on a real Unix socket.

use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use vcache_ipc::{
    read_frame, write_frame, Body, Client, ClientError, Compression, FileData, Message, OpenFlags,
    Request, ResourcePath, Response, Status, WireError,
};

/// Serve one connection, answering each request with the next scripted reply.
fn scripted_server(listener: UnixListener, replies: Vec<Response>) -> thread::JoinHandle<Vec<Request>> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut scratch = Vec::new();
        let mut seen = Vec::new();
        for reply in replies {
            let Some(message) = read_frame(&mut stream, &mut scratch, 1 << 20).unwrap() else {
                break;
            };
            match message.body {
                Body::Request(request) => seen.push(request),
                Body::Response(_) => panic!("client sent a response"),
            }
            write_frame(&mut stream, &Message::response(reply), Compression::Enabled).unwrap();
        }
        seen
    })
}

#[test]
fn test_frames_survive_a_socket_pair() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let content = b"0123456789".repeat(300);
    let sent = Message::request(Request::AppendFile {
        path: ResourcePath::new("/tmp/x/log.txt", "log.txt"),
        content: content.clone(),
    });
    let writer = thread::spawn(move || {
        write_frame(&mut a, &sent, Compression::Enabled).unwrap();
        sent
    });

    let mut scratch = Vec::new();
    let received = read_frame(&mut b, &mut scratch, 4096).unwrap().unwrap();
    let sent = writer.join().unwrap();
    assert_eq!(received, sent);
}

#[test]
fn test_peer_hangup_mid_frame_is_truncated() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let frame = vcache_ipc::frame::encode(
        &Message::request(Request::ReadNFiles { n: 3 }),
        Compression::Disabled,
    )
    .unwrap();
    std::io::Write::write_all(&mut a, &frame[..6]).unwrap();
    drop(a);

    let mut scratch = Vec::new();
    let err = read_frame(&mut b, &mut scratch, 4096).unwrap_err();
    assert!(matches!(err, WireError::Truncated));
}

#[test]
fn test_client_session_and_evicted_files() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("test.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let evicted = FileData::new(ResourcePath::new("/w/old.txt", "old.txt"), b"old".to_vec());
    let server = scripted_server(
        listener,
        vec![
            Response::ok(),
            Response::ok(),
            Response::ok_with_files(vec![evicted.clone()]),
            Response::error(Status::NotPermitted),
            Response::ok(),
        ],
    );

    let mut client = Client::connect(&socket).unwrap();
    client
        .open_file("new.txt", OpenFlags::CREATE | OpenFlags::LOCK)
        .unwrap();
    let got = client.write_file("new.txt", b"fresh").unwrap();
    assert_eq!(got, vec![evicted]);

    let err = client.remove_file("other.txt").unwrap_err();
    assert_eq!(err.status(), Some(Status::NotPermitted));
    assert_eq!(client.bytes_info().written, 5);
    client.close().unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], Request::OpenSession);
    match &seen[1] {
        Request::OpenFile { path, flags } => {
            assert_eq!(path.relative(), "new.txt");
            assert!(path.absolute().ends_with("/new.txt"));
            assert_eq!(*flags, OpenFlags::CREATE | OpenFlags::LOCK);
        }
        other => panic!("unexpected request: {:?}", other),
    }
    assert_eq!(seen[4], Request::CloseSession);
}

#[test]
fn test_client_reports_disconnect() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("test.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let server = scripted_server(listener, vec![Response::ok()]);

    let mut client = Client::connect(&socket).unwrap();
    server.join().unwrap();
    let err = client.read_file("gone.txt").unwrap_err();
    assert!(matches!(
        err,
        ClientError::Disconnected | ClientError::Wire(WireError::Io(_))
    ));
}

#[test]
fn test_connect_with_retry_gives_up() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("missing.sock");
    let err = Client::connect_with_retry(
        &socket,
        Duration::from_millis(10),
        Duration::from_millis(50),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ClientError::Connect { .. }));
}
