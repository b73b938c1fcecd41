use axum::routing::get;
use axum::Router;
use shyllm_server::bootstrap::{conclude, run_server, BootstrapError, Conclusion, ServeOptions, ServeReport};
use shyllm_server::ports::{PortFinder, PortSource};
use shyllm_server::reload;
use std::io;
use std::net::TcpListener;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Always hands out the same port, skipping the probe.
struct FixedPort(u16);

impl PortSource for FixedPort {
    fn acquire(&mut self) -> u16 {
        self.0
    }
}

fn app() -> Router {
    Router::new().route("/health", get(|| async { "ok" }))
}

fn no_reload() -> ServeOptions {
    ServeOptions { reload: None }
}

#[tokio::test]
async fn test_port_taken_at_bind_exits_with_status_one() {
    let occupied = TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();

    let outcome = run_server(app(), &mut FixedPort(port), &no_reload(), std::future::pending()).await;

    match &outcome {
        Err(BootstrapError::PortTaken { port: taken, source }) => {
            assert_eq!(*taken, port);
            assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
        }
        other => panic!("expected PortTaken, got {:?}", other),
    }
    assert_eq!(
        outcome.as_ref().unwrap_err().to_string(),
        "Unable to choose a free port."
    );
    assert_eq!(conclude(outcome).unwrap(), Conclusion::Exit(1));
    drop(occupied);
}

#[tokio::test]
async fn test_serves_on_found_port_until_shutdown() {
    let port = PortFinder::new().find_available_port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        run_server(app(), &mut FixedPort(port), &no_reload(), shutdown).await
    });

    let mut stream = None;
    for _ in 0..100 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut stream = stream.expect("server never accepted a connection");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));

    stop_tx.send(()).unwrap();
    let report = server.await.unwrap().unwrap();
    assert_eq!(report.port, port);
    assert!(!report.reload_requested);
    assert_eq!(conclude(Ok(report)).unwrap(), Conclusion::Exit(0));
}

#[test]
fn test_conclude_reload_and_startup_errors() {
    let report = ServeReport {
        port: 8123,
        elapsed: Duration::from_millis(5),
        reload_requested: true,
    };
    assert_eq!(conclude(Ok(report)).unwrap(), Conclusion::Reload);

    let denied = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
    let err = conclude(Err(BootstrapError::Startup(denied))).unwrap_err();
    assert!(err.to_string().contains("permission denied"));
}

#[tokio::test]
async fn test_file_changed_fires_on_modification() {
    let path = std::env::temp_dir().join(format!("shyllm-reload-{}", std::process::id()));
    std::fs::write(&path, b"v1").unwrap();

    let watcher = tokio::spawn(reload::file_changed(path.clone(), Duration::from_millis(10)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();

    tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .expect("watcher did not notice the change")
        .unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_file_changed_waits_while_unchanged() {
    let path = std::env::temp_dir().join(format!("shyllm-still-{}", std::process::id()));
    std::fs::write(&path, b"v1").unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        reload::file_changed(path.clone(), Duration::from_millis(10)),
    )
    .await;
    assert!(result.is_err());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_relaunch_command_reuses_executable_and_args() {
    let command = reload::relaunch_command().unwrap();

    assert_eq!(command.get_program(), std::env::current_exe().unwrap().as_os_str());
    let args: Vec<_> = command.get_args().collect();
    let expected: Vec<_> = std::env::args_os().skip(1).collect();
    assert_eq!(args, expected.iter().map(|a| a.as_os_str()).collect::<Vec<_>>());
}
