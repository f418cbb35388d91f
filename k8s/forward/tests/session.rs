use async_trait::async_trait;
use futures::StreamExt;
use hyper::body::Bytes;
use kube_forward::{
    connect, follow_logs, AdaptiveOptions, AdaptiveProxy, BoxUpstream, Candidate,
    ConnectOptions, Endpoint, Error, ErrorKind, Instance, InstanceAccess, Lifecycle, LocalPort,
    LogOptions, LogStream, PodSelector, PortForward, ProxyConfig, Resolver, SelectionQuery,
    SessionContext, Stopped, WorkloadSource,
};
use shutdown::StopSignal;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    signal::unix::SignalKind,
    sync::mpsc,
};

/// Workloads with a fixed set of candidates, whose attachable pods can be changed.
struct FakeWorkloads {
    candidates: Vec<&'static str>,
    pods: Mutex<Vec<&'static str>>,
    listed: AtomicUsize,
}
impl FakeWorkloads {
    fn new(candidates: Vec<&'static str>, pods: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            pods: Mutex::new(pods),
            listed: AtomicUsize::new(0),
        })
    }
    fn set_pods(&self, pods: Vec<&'static str>) {
        *self.pods.lock().unwrap() = pods;
    }
}
#[async_trait]
impl WorkloadSource for FakeWorkloads {
    async fn list_candidates(&self, _query: &SelectionQuery) -> Result<Vec<Candidate>, Error> {
        self.listed.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .candidates
            .iter()
            .map(|name| Candidate::new(*name, PodSelector::Labels(format!("app={name}"))))
            .collect())
    }
    async fn attachable_instances(&self, _: &Candidate) -> Result<Vec<Instance>, Error> {
        let pods = self.pods.lock().unwrap().clone();
        Ok(pods
            .into_iter()
            .map(|pod| Instance::new("default", pod, Some("app".to_string())))
            .collect())
    }
}

/// Each upstream echoes what it receives, prefixed by the pod it reaches.
struct EchoAccess {
    logs: Result<&'static str, &'static str>,
}
impl EchoAccess {
    fn new() -> Arc<Self> {
        Arc::new(Self { logs: Ok("ready\n") })
    }
    fn failing_logs() -> Arc<Self> {
        Arc::new(Self {
            logs: Err("container is not running"),
        })
    }
}
#[async_trait]
impl InstanceAccess for EchoAccess {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxUpstream, Error> {
        let (upstream, mut pod_side) = tokio::io::duplex(1024);
        let pod = endpoint.pod().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let read = match pod_side.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                let reply = format!("{pod}:{}", String::from_utf8_lossy(&buf[.. read]));
                if pod_side.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(upstream))
    }
    async fn logs(&self, _: &Endpoint, _: &LogOptions) -> Result<LogStream, Error> {
        match self.logs {
            Ok(line) => Ok(futures::stream::iter([Ok(Bytes::from_static(line.as_bytes()))])
                .chain(futures::stream::pending())
                .boxed()),
            Err(message) => Err(Error::NotFound {
                message: message.to_string(),
            }),
        }
    }
}

fn options(query: SelectionQuery, local_port: &str) -> ConnectOptions {
    ConnectOptions {
        query,
        local_port: local_port.to_string(),
        remote_port: 80,
        resolution_timeout: Duration::from_secs(30),
        logs: LogOptions::follow(),
        adaptive: None,
    }
}

fn lifecycle(
    grace: Duration,
) -> (
    Lifecycle<mpsc::Receiver<SignalKind>, Vec<u8>>,
    mpsc::Sender<SignalKind>,
) {
    let (sender, receiver) = mpsc::channel(4);
    (
        Lifecycle::new(receiver, grace).with_notice(Vec::new()),
        sender,
    )
}

/// Sends one interrupt after the given delay.
fn interrupt_after(interrupts: mpsc::Sender<SignalKind>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        interrupts.send(SignalKind::interrupt()).await.ok();
    });
}

async fn exchange(conn: &mut TcpStream, message: &str, expected: &str) {
    conn.write_all(message.as_bytes()).await.unwrap();
    let mut reply = vec![0u8; expected.len()];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(String::from_utf8(reply).unwrap(), expected);
}

/// Connects to the local port, retrying while the session is still starting.
async fn connect_local(port: u16) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(conn) => break conn,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap()
}

/// Access whose pods can no longer be port-forwarded to.
struct GoneAccess;
#[async_trait]
impl InstanceAccess for GoneAccess {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<BoxUpstream, Error> {
        Err(Error::NotFound {
            message: "pod is gone".to_string(),
        })
    }
    async fn logs(&self, _: &Endpoint, _: &LogOptions) -> Result<LogStream, Error> {
        Ok(futures::stream::pending().boxed())
    }
}

#[tokio::test]
async fn demo_session_stops_on_interrupt() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let (lifecycle, interrupts) = lifecycle(Duration::from_secs(2));
    let stop = lifecycle.stop_signal();

    let query = SelectionQuery::by_name("demo").unwrap();
    let session =
        tokio::spawn(async move { connect(&ctx, options(query, "18081"), lifecycle).await });

    let mut conn = connect_local(18081).await;
    exchange(&mut conn, "ping", "demo-1:ping").await;
    assert!(!stop.is_stopped());

    interrupts.send(SignalKind::interrupt()).await.unwrap();
    let started = std::time::Instant::now();
    let stopped = tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stopped, Stopped::Completed);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(stop.is_stopped());
}

#[tokio::test]
async fn fatal_tunnel_error_ends_the_session() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads, Arc::new(GoneAccess));
    let (lifecycle, _interrupts) = lifecycle(Duration::from_secs(1));
    let stop = lifecycle.stop_signal();

    let query = SelectionQuery::by_name("demo").unwrap();
    let session =
        tokio::spawn(async move { connect(&ctx, options(query, "18082"), lifecycle).await });

    let _conn = connect_local(18082).await;
    let error = tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(error.to_string(), "pod is gone");
    assert!(stop.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn interrupted_while_resolving() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec![]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let (lifecycle, interrupts) = lifecycle(Duration::from_secs(2));
    let stop = lifecycle.stop_signal();
    interrupt_after(interrupts, Duration::from_secs(1));

    let query = SelectionQuery::by_name("demo").unwrap();
    let started = tokio::time::Instant::now();
    let stopped = connect(&ctx, options(query, ""), lifecycle).await.unwrap();
    assert_eq!(stopped, Stopped::Interrupted);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(stop.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn logs_stopped_while_resolving() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec![]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let query = SelectionQuery::by_name("demo").unwrap();
    let stop = StopSignal::new();

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.stop();
    });
    let started = tokio::time::Instant::now();
    let mut output = Vec::new();
    follow_logs(
        &ctx,
        &query,
        Duration::from_secs(30),
        LogOptions::follow(),
        &mut output,
        &stop,
    )
    .await
    .unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(output.is_empty());
}

#[tokio::test]
async fn empty_candidate_set_is_not_found() {
    let workloads = FakeWorkloads::new(vec![], vec![]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let (lifecycle, _interrupts) = lifecycle(Duration::from_secs(2));

    let query = SelectionQuery::by_label("app", "demo").unwrap();
    let error = connect(&ctx, options(query, ""), lifecycle).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn malformed_local_port_is_rejected_before_listing() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads.clone(), EchoAccess::new());
    let (lifecycle, _interrupts) = lifecycle(Duration::from_secs(2));

    let query = SelectionQuery::by_name("demo").unwrap();
    let error = connect(&ctx, options(query, "8081:80"), lifecycle)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(workloads.listed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_log_follower_keeps_the_session() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads, EchoAccess::failing_logs());
    let (lifecycle, interrupts) = lifecycle(Duration::from_secs(2));
    let stop = lifecycle.stop_signal();

    let query = SelectionQuery::by_name("demo").unwrap();
    let session = tokio::spawn(async move { connect(&ctx, options(query, ""), lifecycle).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.is_finished());
    assert!(!stop.is_stopped());

    interrupts.send(SignalKind::interrupt()).await.unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stopped, Stopped::Completed);
}

#[tokio::test]
async fn tunnel_forwards_bytes() {
    let endpoint = Endpoint::new(Instance::new("default", "demo-1", None), 80);
    let tunnel = PortForward::bind(LocalPort::ephemeral(), endpoint, EchoAccess::new())
        .await
        .unwrap();
    let port = tunnel.local_port().unwrap();
    assert_ne!(port, 0);

    let stop = StopSignal::new();
    let running = tokio::spawn(tunnel.run(stop.clone()));

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    exchange(&mut conn, "ping", "demo-1:ping").await;
    exchange(&mut conn, "pong", "demo-1:pong").await;

    stop.stop();
    running.await.unwrap().unwrap();
    // the listener is released once the tunnel is over
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn backend_swap_keeps_established_connections() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let resolver = Resolver::new(workloads.clone());
    let query = SelectionQuery::by_name("demo").unwrap();
    let config = ProxyConfig::new(query, 80, Duration::from_millis(20));
    let stop = StopSignal::new();

    let handle = AdaptiveProxy::new(resolver, EchoAccess::new(), config)
        .start(LocalPort::ephemeral(), LocalPort::ephemeral(), stop.clone())
        .await
        .unwrap();
    let port = handle.local_port();
    wait_for_backend(|| handle.backend(), "demo-1").await;

    let mut established = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    exchange(&mut established, "one", "demo-1:one").await;

    workloads.set_pods(vec!["demo-2"]);
    wait_for_backend(|| handle.backend(), "demo-2").await;

    exchange(&mut established, "two", "demo-1:two").await;
    let mut fresh = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    exchange(&mut fresh, "three", "demo-2:three").await;

    // the backend is never cleared once selected
    workloads.set_pods(vec![]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.backend().unwrap().pod(), "demo-2");

    stop.stop();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap()
        .unwrap();
}

async fn wait_for_backend(backend: impl Fn() -> Option<Arc<Endpoint>>, pod: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend().map(|endpoint| endpoint.pod().to_string()).as_deref() != Some(pod) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn adaptive_session_stops_on_interrupt() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let (lifecycle, interrupts) = lifecycle(Duration::from_secs(2));
    interrupt_after(interrupts, Duration::from_millis(100));

    let query = SelectionQuery::by_label("app", "demo").unwrap();
    let mut options = options(query, "");
    options.adaptive = Some(AdaptiveOptions {
        admin_port: String::new(),
        refresh_interval: Duration::from_millis(20),
    });
    let stopped = connect(&ctx, options, lifecycle).await.unwrap();
    assert_eq!(stopped, Stopped::Completed);
}

#[tokio::test]
async fn logs_of_the_resolved_pod() {
    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let ctx = SessionContext::new(workloads, EchoAccess::new());
    let query = SelectionQuery::by_name("demo").unwrap();
    let stop = StopSignal::new();

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.stop();
    });
    let mut output = Vec::new();
    follow_logs(
        &ctx,
        &query,
        Duration::from_secs(1),
        LogOptions::dump(),
        &mut output,
        &stop,
    )
    .await
    .unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), "ready\n");

    let workloads = FakeWorkloads::new(vec!["demo"], vec!["demo-1"]);
    let failing = SessionContext::new(workloads, EchoAccess::failing_logs());
    let error = follow_logs(
        &failing,
        &query,
        Duration::from_secs(1),
        LogOptions::dump(),
        &mut Vec::new(),
        &StopSignal::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}
