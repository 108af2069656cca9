//! Runner against a live server.

use std::fs;

use vcache_cli::{Options, Runner};
use vcache_config::testing::TestEnvironment;
use vcache_ipc::Compression;
use vcache_server::{Server, ShutdownMode};

fn options(env: &TestEnvironment) -> Options {
    let mut options = Options::new(&env.socket_path);
    options.evicted_dir = Some(env.evicted_dir.clone());
    options.read_dir = Some(env.read_dir.clone());
    options
}

#[test]
fn test_write_then_read_saves_locally() {
    let env = TestEnvironment::new().unwrap();
    let (handle, server) = Server::spawn(env.server_config()).unwrap();

    let source = env.create_file("notes/todo.txt", b"buy milk").unwrap();
    let mut runner = Runner::connect(options(&env)).unwrap();
    runner.write_files(&[source.clone()]).unwrap();

    let name = source.to_str().unwrap().to_string();
    let files = runner.read_files(&[name]).unwrap();
    assert_eq!(files[0].content, b"buy milk");
    let bytes = runner.finish().unwrap();
    assert_eq!(bytes.written, 8);
    assert_eq!(bytes.read, 8);

    // saved under the name the client used, rooted in the read dir
    let saved = env.read_dir.join(source.strip_prefix("/").unwrap());
    assert_eq!(fs::read(saved).unwrap(), b"buy milk");

    handle.shutdown(ShutdownMode::Stop);
    server.join().unwrap().unwrap();
}

#[test]
fn test_evicted_files_land_in_evicted_dir() {
    let env = TestEnvironment::new().unwrap();
    let (handle, server) = Server::spawn(env.server_config_with_capacity(1, 2)).unwrap();

    for name in ["a", "b", "c"] {
        env.create_file(name, name.repeat(10).as_bytes()).unwrap();
    }
    let mut runner = Runner::connect(options(&env)).unwrap();
    assert_eq!(runner.write_dir(&env.work_dir, 0).unwrap(), 3);
    runner.finish().unwrap();

    let evicted = env.evicted_dir.join(env.work_dir.join("a").strip_prefix("/").unwrap());
    assert_eq!(fs::read(evicted).unwrap(), b"aaaaaaaaaa");

    handle.shutdown(ShutdownMode::Stop);
    let report = server.join().unwrap().unwrap();
    assert_eq!(report.files.len(), 2);
}

#[test]
fn test_append_lock_remove() {
    let env = TestEnvironment::new().unwrap();
    let (handle, server) = Server::spawn(env.server_config()).unwrap();

    let target = env.create_file("log", b"one").unwrap();
    let extra = env.create_file("extra", b"+two").unwrap();
    let name = target.to_str().unwrap().to_string();

    let mut options = options(&env);
    options.compression = Compression::Enabled;
    let mut runner = Runner::connect(options).unwrap();
    runner.write_files(&[target]).unwrap();
    runner.append(&name, &extra).unwrap();
    assert_eq!(runner.read_n(0).unwrap()[0].content, b"one+two");

    runner.lock(&[name.clone()]).unwrap();
    runner.unlock(&[name.clone()]).unwrap();
    runner.remove(&[name.clone()]).unwrap();
    assert!(runner.read_files(&[name]).is_err());

    handle.shutdown(ShutdownMode::Drain);
    let report = server.join().unwrap().unwrap();
    assert!(report.files.is_empty());
}

#[test]
fn test_connect_fails_without_server() {
    let env = TestEnvironment::new().unwrap();
    let mut options = Options::new(&env.socket_path);
    options.connect_timeout = std::time::Duration::from_millis(50);
    options.retry_interval = std::time::Duration::from_millis(10);
    assert!(Runner::connect(options).is_err());
}

#[test]
fn test_write_of_stored_name_fails_and_keeps_content() {
    let env = TestEnvironment::new().unwrap();
    let (handle, server) = Server::spawn(env.server_config()).unwrap();

    let source = env.create_file("dup.txt", b"first").unwrap();
    let name = source.to_str().unwrap().to_string();
    let mut runner = Runner::connect(options(&env)).unwrap();
    runner.write_files(&[source.clone()]).unwrap();

    fs::write(&source, b"second").unwrap();
    let err = runner.write_files(&[source]).unwrap_err();
    assert!(err.to_string().contains("create"));
    assert_eq!(runner.read_files(&[name]).unwrap()[0].content, b"first");
    runner.finish().unwrap();

    handle.shutdown(ShutdownMode::Stop);
    server.join().unwrap().unwrap();
}
