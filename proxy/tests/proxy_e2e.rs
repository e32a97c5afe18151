//! End-to-end suite: real TCP, mock upstream pools, scripted miner.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use dpmp_proxy::config::{
    Config, LogConfig, MetricsConfig, Mode, PoolConfig, PoolFlavour, StatusConfig, StratumConfig,
    Weights,
};
use dpmp_proxy::supervisor::Supervisor;

const WAIT: Duration = Duration::from_secs(10);

// ─── Mock upstream pool ────────────────────────────────────────────────

#[derive(Clone)]
struct MockPoolOptions {
    difficulty: f64,
    job_id: String,
    prevhash: String,
    /// Push `mining.set_difficulty` right after the subscribe response,
    /// before authorize completes (ck-family bootstrap behaviour).
    early_difficulty: bool,
    accept_shares: bool,
}

impl Default for MockPoolOptions {
    fn default() -> Self {
        Self {
            difficulty: 1024.0,
            job_id: "job-1".to_string(),
            prevhash: "aa".repeat(32),
            early_difficulty: false,
            accept_shares: true,
        }
    }
}

struct MockPool {
    addr: SocketAddr,
    methods: Arc<Mutex<Vec<String>>>,
    submits: Arc<Mutex<Vec<Vec<Value>>>>,
    drop_tx: broadcast::Sender<()>,
}

impl MockPool {
    async fn spawn(options: MockPoolOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let methods = Arc::new(Mutex::new(Vec::new()));
        let submits = Arc::new(Mutex::new(Vec::new()));
        let (drop_tx, _) = broadcast::channel(4);

        let pool = Self {
            addr,
            methods: methods.clone(),
            submits: submits.clone(),
            drop_tx: drop_tx.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let methods = methods.clone();
                let submits = submits.clone();
                let options = options.clone();
                let drop_rx = drop_tx.subscribe();
                tokio::spawn(async move {
                    let _ = serve_pool(stream, methods, submits, options, drop_rx).await;
                });
            }
        });

        pool
    }

    /// Close every live connection, as a pool restart would.
    fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    async fn methods(&self) -> Vec<String> {
        self.methods.lock().await.clone()
    }

    async fn submits(&self) -> Vec<Vec<Value>> {
        self.submits.lock().await.clone()
    }

    fn pool_config(&self, user: &str, flavour: PoolFlavour) -> PoolConfig {
        PoolConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            tls: false,
            user: user.to_string(),
            pass: "x".to_string(),
            flavour,
            extranonce_subscribe: false,
        }
    }
}

async fn serve_pool(
    stream: TcpStream,
    methods: Arc<Mutex<Vec<String>>>,
    submits: Arc<Mutex<Vec<Vec<Value>>>>,
    options: MockPoolOptions,
    mut drop_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    async fn write_json(w: &mut OwnedWriteHalf, v: Value) -> std::io::Result<()> {
        let mut line = v.to_string();
        line.push('\n');
        w.write_all(line.as_bytes()).await
    }

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
            _ = drop_rx.recv() => return Ok(()),
        };
        let parsed: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let id = parsed.get("id").cloned().unwrap_or(Value::Null);
        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        methods.lock().await.push(method.to_string());

        match method {
            "mining.subscribe" => {
                write_json(
                    &mut write_half,
                    json!({
                        "id": id,
                        "result": [[["mining.notify", "s1"], ["mining.set_difficulty", "s1"]], "ab12", 8],
                        "error": null,
                    }),
                )
                .await?;
                if options.early_difficulty {
                    write_json(
                        &mut write_half,
                        json!({"id": null, "method": "mining.set_difficulty", "params": [options.difficulty]}),
                    )
                    .await?;
                }
            }
            "mining.authorize" => {
                write_json(&mut write_half, json!({"id": id, "result": true, "error": null})).await?;
                if !options.early_difficulty {
                    write_json(
                        &mut write_half,
                        json!({"id": null, "method": "mining.set_difficulty", "params": [options.difficulty]}),
                    )
                    .await?;
                }
                write_json(
                    &mut write_half,
                    json!({
                        "id": null,
                        "method": "mining.notify",
                        "params": [
                            options.job_id,
                            options.prevhash,
                            "01000000",
                            "ffffffff",
                            [],
                            "20000000",
                            "1a01a234",
                            "6632f0aa",
                            true,
                        ],
                    }),
                )
                .await?;
            }
            "mining.extranonce.subscribe" => {
                write_json(&mut write_half, json!({"id": id, "result": true, "error": null})).await?;
            }
            "mining.submit" => {
                let params = parsed
                    .get("params")
                    .and_then(|p| p.as_array())
                    .cloned()
                    .unwrap_or_default();
                submits.lock().await.push(params);
                if options.accept_shares {
                    write_json(&mut write_half, json!({"id": id, "result": true, "error": null})).await?;
                } else {
                    write_json(
                        &mut write_half,
                        json!({"id": id, "result": false, "error": [23, "Low difficulty share", null]}),
                    )
                    .await?;
                }
            }
            _ => {
                write_json(&mut write_half, json!({"id": id, "result": true, "error": null})).await?;
            }
        }
    }
}

// ─── Scripted miner ────────────────────────────────────────────────────

struct TestMiner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl TestMiner {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr)).await.unwrap().unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            next_id: 1,
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = json!({"id": id, "method": method, "params": params}).to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        id
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for proxy message")
            .unwrap()
            .expect("proxy closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Read frames until one satisfies the predicate, returning it.
    async fn recv_until<F: Fn(&Value) -> bool>(&mut self, what: &str, predicate: F) -> Value {
        for _ in 0..50 {
            let v = self.recv().await;
            if predicate(&v) {
                return v;
            }
        }
        panic!("never received {}", what);
    }

    async fn handshake(&mut self, username: &str) -> Value {
        let sub_id = self.request("mining.subscribe", json!(["test-miner/1.0"])).await;
        let sub = self
            .recv_until("subscribe response", |v| v.get("id") == Some(&json!(sub_id)))
            .await;
        let auth_id = self.request("mining.authorize", json!([username, "x"])).await;
        let auth = self
            .recv_until("authorize response", |v| v.get("id") == Some(&json!(auth_id)))
            .await;
        assert_eq!(auth["result"], json!(true));
        sub
    }
}

fn is_notification(v: &Value, method: &str) -> bool {
    v.get("method").and_then(|m| m.as_str()) == Some(method)
}

// ─── Harness ───────────────────────────────────────────────────────────

fn test_config(pool_a: PoolConfig, pool_b: PoolConfig, weights: Weights, slot: u64) -> Config {
    Config {
        pool_a,
        pool_b,
        weights,
        mode: Mode::Fixed,
        slot_seconds: slot,
        dwell_floor_seconds: 30,
        stale_grace_seconds: 20,
        autobalance: Default::default(),
        log: LogConfig::default(),
        metrics: MetricsConfig::default(),
        stratum: StratumConfig {
            bind: "127.0.0.1:0".to_string(),
            ..Default::default()
        },
        status: StatusConfig::default(),
    }
}

async fn start_proxy(config: Config) -> (Arc<Supervisor>, SocketAddr) {
    let supervisor = Supervisor::new(config);
    supervisor.start().await.unwrap();

    let mut bound = supervisor.downstream().bound_addr();
    let addr = timeout(WAIT, async {
        loop {
            if let Some(addr) = *bound.borrow() {
                return addr;
            }
            if bound.changed().await.is_err() {
                panic!("listener died before binding");
            }
        }
    })
    .await
    .expect("stratum listener never bound");

    (supervisor, addr)
}

async fn wait_for_ready(supervisor: &Arc<Supervisor>, pools_ready: usize) {
    timeout(WAIT, async {
        loop {
            let status = supervisor.status().await;
            let ready = status
                .upstreams
                .iter()
                .filter(|u| format!("{:?}", u.state).eq_ignore_ascii_case("ready"))
                .count();
            if ready >= pools_ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("upstreams never became ready");
}

// ─── Scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn single_pool_boundary_routes_everything_to_a() {
    let mock_a = MockPool::spawn(MockPoolOptions::default()).await;
    let mock_b = MockPool::spawn(MockPoolOptions {
        prevhash: "bb".repeat(32),
        job_id: "b-job".into(),
        ..Default::default()
    })
    .await;

    let config = test_config(
        mock_a.pool_config("wallet_a.rig", PoolFlavour::Generic),
        mock_b.pool_config("wallet_b.rig", PoolFlavour::Generic),
        Weights { a: 100, b: 0 },
        60,
    );
    let (supervisor, addr) = start_proxy(config).await;
    wait_for_ready(&supervisor, 2).await;

    let mut miner = TestMiner::connect(addr).await;
    let sub = miner.handshake("someminer.worker1").await;

    // Proxy-minted extranonce1: 4 bytes, fixed extranonce2_size of 4.
    let result = sub["result"].as_array().unwrap();
    let extranonce1 = result[1].as_str().unwrap();
    assert_eq!(extranonce1.len(), 8);
    assert_eq!(result[2], json!(4));

    // set_difficulty arrives before the first notify.
    let first = miner
        .recv_until("difficulty or notify", |v| {
            is_notification(v, "mining.set_difficulty") || is_notification(v, "mining.notify")
        })
        .await;
    assert!(is_notification(&first, "mining.set_difficulty"), "got {:?}", first);
    assert_eq!(first["params"][0], json!(1024.0));

    let notify = miner.recv_until("job notify", |v| is_notification(v, "mining.notify")).await;
    let proxy_job_id = notify["params"][0].as_str().unwrap().to_string();
    // Job comes from pool A, id rewritten by the proxy.
    assert_eq!(notify["params"][1].as_str().unwrap(), "aa".repeat(32));
    assert_ne!(proxy_job_id, "job-1");

    // Submit a share; it must land on pool A and echo the pool's verdict.
    let submit_id = miner
        .request(
            "mining.submit",
            json!(["someminer.worker1", proxy_job_id, "00000001", "6632f0aa", "deadbeef"]),
        )
        .await;
    let reply = miner
        .recv_until("submit response", |v| v.get("id") == Some(&json!(submit_id)))
        .await;
    assert_eq!(reply["result"], json!(true));

    let submits_a = mock_a.submits().await;
    assert_eq!(submits_a.len(), 1);
    assert!(mock_b.submits().await.is_empty());

    // Credentials upstream are the proxy's own pool credentials.
    assert_eq!(submits_a[0][0], json!("wallet_a.rig"));
    // Original pool job id restored.
    assert_eq!(submits_a[0][1], json!("job-1"));
    // Extranonce rebuilt: 2 counter bytes ∥ 4 miner bytes ∥ 2 pad bytes.
    assert_eq!(submits_a[0][2], json!("0000000000010000"));

    // No switch events at the 100:0 boundary.
    let status = supervisor.status().await;
    assert!(status.scheduler.recent_switches.is_empty());

    supervisor.shutdown();
}

#[tokio::test]
async fn duplicate_submit_is_rejected_locally() {
    let mock_a = MockPool::spawn(MockPoolOptions::default()).await;
    let mock_b = MockPool::spawn(MockPoolOptions::default()).await;

    let config = test_config(
        mock_a.pool_config("wallet_a.rig", PoolFlavour::Generic),
        mock_b.pool_config("wallet_b.rig", PoolFlavour::Generic),
        Weights { a: 100, b: 0 },
        60,
    );
    let (supervisor, addr) = start_proxy(config).await;
    wait_for_ready(&supervisor, 2).await;

    let mut miner = TestMiner::connect(addr).await;
    miner.handshake("someminer.rig").await;
    let notify = miner.recv_until("job notify", |v| is_notification(v, "mining.notify")).await;
    let proxy_job_id = notify["params"][0].as_str().unwrap().to_string();

    let params = json!(["someminer.rig", proxy_job_id, "00000002", "6632f0aa", "cafebabe"]);
    let first_id = miner.request("mining.submit", params.clone()).await;
    let first = miner
        .recv_until("first submit response", |v| v.get("id") == Some(&json!(first_id)))
        .await;
    assert_eq!(first["result"], json!(true));

    let second_id = miner.request("mining.submit", params).await;
    let second = miner
        .recv_until("second submit response", |v| v.get("id") == Some(&json!(second_id)))
        .await;
    assert_eq!(second["error"], json!([22, "Duplicate share", null]));

    // Upstream saw exactly one submit.
    assert_eq!(mock_a.submits().await.len(), 1);

    supervisor.shutdown();
}

#[tokio::test]
async fn upstream_drop_fails_over_with_ordered_messages() {
    let mock_a = MockPool::spawn(MockPoolOptions::default()).await;
    let mock_b = MockPool::spawn(MockPoolOptions {
        difficulty: 2048.0,
        job_id: "b-job".into(),
        prevhash: "bb".repeat(32),
        ..Default::default()
    })
    .await;

    // Equal weights, hour-long slots: the only mid-test switch can be the
    // fail-over.
    let config = test_config(
        mock_a.pool_config("wallet_a.rig", PoolFlavour::Generic),
        mock_b.pool_config("wallet_b.rig", PoolFlavour::Generic),
        Weights { a: 1, b: 1 },
        3600,
    );
    let (supervisor, addr) = start_proxy(config).await;
    wait_for_ready(&supervisor, 2).await;

    let mut miner = TestMiner::connect(addr).await;
    miner.handshake("someminer.rig").await;
    let notify = miner.recv_until("job notify", |v| is_notification(v, "mining.notify")).await;
    assert_eq!(notify["params"][1].as_str().unwrap(), "aa".repeat(32));

    // Pool A restarts; the miner must be re-routed to B immediately:
    // set_difficulty first, then notify with clean_jobs=true.
    mock_a.drop_connections();

    let diff = miner
        .recv_until("fail-over difficulty", |v| {
            is_notification(v, "mining.set_difficulty") && v["params"][0] == json!(2048.0)
        })
        .await;
    assert_eq!(diff["params"][0], json!(2048.0));

    let notify = miner
        .recv_until("fail-over notify", |v| {
            is_notification(v, "mining.notify")
                && v["params"][1].as_str() == Some("bb".repeat(32).as_str())
        })
        .await;
    // clean_jobs forced true across the switch.
    assert_eq!(notify["params"][8], json!(true));

    // Late submits against the B job land on B, never on A.
    let proxy_job_id = notify["params"][0].as_str().unwrap().to_string();
    let submit_id = miner
        .request(
            "mining.submit",
            json!(["someminer.rig", proxy_job_id, "00000003", "6632f0aa", "0badf00d"]),
        )
        .await;
    let reply = miner
        .recv_until("submit response", |v| v.get("id") == Some(&json!(submit_id)))
        .await;
    assert_eq!(reply["result"], json!(true));
    assert_eq!(mock_b.submits().await.len(), 1);
    assert!(mock_a.submits().await.is_empty());

    supervisor.shutdown();
}

#[tokio::test]
async fn clean_switch_at_equal_difficulty_keeps_message_order() {
    // Both pools Ready at the SAME difficulty: the switch must still write
    // set_difficulty before notify(clean_jobs=true) on every re-route.
    let mock_a = MockPool::spawn(MockPoolOptions::default()).await;
    let mock_b = MockPool::spawn(MockPoolOptions {
        job_id: "b-job".into(),
        prevhash: "bb".repeat(32),
        ..Default::default()
    })
    .await;

    let mut config = test_config(
        mock_a.pool_config("wallet_a.rig", PoolFlavour::Generic),
        mock_b.pool_config("wallet_b.rig", PoolFlavour::Generic),
        Weights { a: 1, b: 1 },
        1,
    );
    config.dwell_floor_seconds = 0;

    let (supervisor, addr) = start_proxy(config).await;
    wait_for_ready(&supervisor, 2).await;

    let mut miner = TestMiner::connect(addr).await;
    miner.handshake("someminer.rig").await;

    // Walk the message stream: every notify must directly follow a
    // set_difficulty carrying the shared value, and each pool change must
    // set clean_jobs=true.
    let mut previous: Option<Value> = None;
    let mut last_prevhash: Option<String> = None;
    let mut pools_seen = std::collections::HashSet::new();
    let mut switches = 0usize;

    for _ in 0..40 {
        let msg = miner.recv().await;
        if is_notification(&msg, "mining.notify") {
            let before = previous.as_ref().expect("notify was the first message");
            assert!(
                is_notification(before, "mining.set_difficulty"),
                "notify not preceded by set_difficulty but by {:?}",
                before
            );
            assert_eq!(before["params"][0], json!(1024.0));

            let prevhash = msg["params"][1].as_str().unwrap().to_string();
            if let Some(last) = &last_prevhash {
                if *last != prevhash {
                    switches += 1;
                    assert_eq!(msg["params"][8], json!(true), "switch notify without clean_jobs");
                }
            }
            pools_seen.insert(prevhash.clone());
            last_prevhash = Some(prevhash);
        }
        previous = Some(msg);
        if switches >= 2 && pools_seen.len() == 2 {
            break;
        }
    }

    assert_eq!(pools_seen.len(), 2, "miner never visited both pools: {:?}", pools_seen);
    assert!(switches >= 2, "expected at least two slot switches, saw {}", switches);

    supervisor.shutdown();
}

#[tokio::test]
async fn ck_type_bootstrap_subscribes_extranonce_before_authorize() {
    let mock_a = MockPool::spawn(MockPoolOptions {
        difficulty: 2048.0,
        early_difficulty: true,
        ..Default::default()
    })
    .await;
    let mock_b = MockPool::spawn(MockPoolOptions::default()).await;

    let config = test_config(
        mock_a.pool_config("wallet_a.rig", PoolFlavour::CkType),
        mock_b.pool_config("wallet_b.rig", PoolFlavour::Generic),
        Weights { a: 100, b: 0 },
        60,
    );
    let (supervisor, addr) = start_proxy(config).await;
    wait_for_ready(&supervisor, 2).await;

    // Bootstrap order: subscribe, extranonce.subscribe, authorize.
    let methods = mock_a.methods().await;
    let sub = methods.iter().position(|m| m == "mining.subscribe").unwrap();
    let en = methods
        .iter()
        .position(|m| m == "mining.extranonce.subscribe")
        .expect("ck-type pool never saw extranonce.subscribe");
    let auth = methods.iter().position(|m| m == "mining.authorize").unwrap();
    assert!(sub < en && en < auth, "bootstrap order was {:?}", methods);

    // The pre-job difficulty applies to the first forwarded job.
    let mut miner = TestMiner::connect(addr).await;
    miner.handshake("someminer.rig").await;
    let first = miner
        .recv_until("difficulty or notify", |v| {
            is_notification(v, "mining.set_difficulty") || is_notification(v, "mining.notify")
        })
        .await;
    assert!(is_notification(&first, "mining.set_difficulty"));
    assert_eq!(first["params"][0], json!(2048.0));
    miner.recv_until("job notify", |v| is_notification(v, "mining.notify")).await;

    supervisor.shutdown();
}
