#![allow(dead_code)]

pub use captains_log::logfn;
use captains_log::*;
use razor_mesh::server::{RpcServer, ServerTransport, ServiceMux};
use razor_mesh::{ServerConfig, codec::MsgpCodec};
use rstest::*;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{fmt, time::Duration};
use tokio::runtime::Runtime;

pub type Codec = MsgpCodec;

pub type TestServer = RpcServer<ServiceMux<Codec>, Codec>;

pub const ECHO: &str = "demo.Echo";

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

pub struct TestRunner {
    pub rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/razor_mesh_test.log", Level::Trace).test().build().expect("log");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(2))
            .enable_all()
            .build()
            .expect("runtime");
        Self { rt }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

/// Calls to `demo.Echo.hit` are counted here
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Poll until the count reaches `n`, within `timeout`
    pub async fn wait(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.get() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.get() >= n
    }
}

/// The service for tests:
///
/// - `echo(String) -> String`
/// - `fail(String)`: always returns error `failed: {arg}`
/// - `sleep(u64) -> u64`: sleeps for milliseconds
/// - `panic(())`
/// - `panic_now`: a raw handler panicking before it returns the future
/// - `hit(())`: increase [Hits]
pub fn new_mux() -> (ServiceMux<Codec>, Hits) {
    let hits = Hits::default();
    let mut mux = ServiceMux::<Codec>::new();
    mux.add_method(ECHO, "echo", |s: String| async move { Ok::<String, String>(s) });
    mux.add_method(ECHO, "fail", |s: String| async move { Err::<String, String>(format!("failed: {}", s)) });
    mux.add_method(ECHO, "sleep", |ms: u64| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok::<u64, String>(ms)
    });
    mux.add_method(ECHO, "panic", |_: ()| async move {
        if true {
            panic!("panic in service");
        }
        Ok::<(), String>(())
    });
    mux.add_raw(ECHO, "panic_now", |_: Vec<u8>| -> std::future::Ready<Result<Vec<u8>, String>> {
        panic!("panic before the handler future")
    });
    let counter = hits.clone();
    mux.add_method(ECHO, "hit", move |_: ()| {
        let hits = counter.clone();
        async move {
            hits.0.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        }
    });
    mux.set_location(ECHO, "demo::EchoImpl");
    (mux, hits)
}

/// Start a server on a random local port, returns the server with its address
pub async fn init_server<T: ServerTransport>(config: ServerConfig) -> (TestServer, Hits, String) {
    let (mux, hits) = new_mux();
    let server = TestServer::new(config, Arc::new(mux));
    let addr = server.listen::<T>("127.0.0.1:0").await.expect("server listen");
    debug!("server listen on {}", addr);
    (server, hits, addr)
}
