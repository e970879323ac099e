use crate::Codec;
use crate::proto::RpcRequest;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Maps a service key plus a method to the local implementation.
///
/// The error string is carried back to the caller in the error response.
/// A panic inside `invoke` is captured by the worker and reported the same way.
pub trait ServiceInvoker: Send + Sync + 'static {
    fn invoke(&self, req: &RpcRequest) -> impl Future<Output = Result<Vec<u8>, String>> + Send;

    /// `(service key, location)` of every service exposed, for publishing and diagnostics
    fn services(&self) -> Vec<(String, String)>;
}

type Handler = Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync>;

struct ServiceEntry {
    location: String,
    methods: HashMap<String, Handler>,
}

/// A [ServiceInvoker] backed by a map of handlers.
///
/// # Example
///
/// ```rust
/// use razor_mesh::codec::MsgpCodec;
/// use razor_mesh::server::ServiceMux;
///
/// let mut mux = ServiceMux::<MsgpCodec>::new();
/// mux.add_method("demo.Echo", "echo", |s: String| async move { Ok::<String, String>(s) });
/// mux.set_location("demo.Echo", "demo::EchoImpl");
/// ```
pub struct ServiceMux<C: Codec> {
    codec: Arc<C>,
    services: BTreeMap<String, ServiceEntry>,
}

impl<C: Codec> Default for ServiceMux<C> {
    fn default() -> Self {
        Self { codec: Arc::new(C::default()), services: BTreeMap::new() }
    }
}

impl<C: Codec> ServiceMux<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, service: &str) -> &mut ServiceEntry {
        self.services
            .entry(service.to_string())
            .or_insert_with(|| ServiceEntry { location: service.to_string(), methods: HashMap::new() })
    }

    /// Register a handler working on the encoded params and result
    pub fn add_raw<F, Fut>(&mut self, service: &str, method: &str, f: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |params| Box::pin(f(params)));
        self.entry(service).methods.insert(method.to_string(), handler);
    }

    /// Register a typed handler, arguments and result are converted with the codec
    pub fn add_method<A, R, F, Fut>(&mut self, service: &str, method: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        self.add_raw(service, method, move |params: Vec<u8>| {
            let codec = codec.clone();
            let f = f.clone();
            async move {
                let args: A = codec.decode(&params).map_err(|_| "decode args error".to_string())?;
                let r = f(args).await?;
                codec.encode(&r).map_err(|_| "encode result error".to_string())
            }
        });
    }

    /// Describe where the service is implemented, shown by the diagnostic listing
    pub fn set_location(&mut self, service: &str, location: &str) {
        self.entry(service).location = location.to_string();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl<C: Codec> ServiceInvoker for ServiceMux<C> {
    fn invoke(&self, req: &RpcRequest) -> impl Future<Output = Result<Vec<u8>, String>> + Send {
        let fut = match self.services.get(&req.service) {
            None => Err(format!("service not found: {}", req.service)),
            Some(entry) => match entry.methods.get(&req.method) {
                None => Err(format!("method not found: {}.{}", req.service, req.method)),
                Some(handler) => Ok(handler(req.params.clone())),
            },
        };
        async move { fut?.await }
    }

    fn services(&self) -> Vec<(String, String)> {
        self.services.iter().map(|(key, entry)| (key.clone(), entry.location.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgpCodec;

    #[tokio::test]
    async fn test_mux_invoke() {
        let codec = MsgpCodec::default();
        let mut mux = ServiceMux::<MsgpCodec>::new();
        mux.add_method("demo.Calc", "add", |(a, b): (i64, i64)| async move { Ok::<i64, String>(a + b) });
        mux.add_raw("demo.Raw", "fail", |_| async { Err::<Vec<u8>, String>("boom".to_string()) });
        mux.set_location("demo.Calc", "demo::CalcImpl");
        assert_eq!(mux.len(), 2);

        let req = RpcRequest::new("demo.Calc", "add", codec.encode(&(1i64, 2i64)).expect("encode"));
        let r = mux.invoke(&req).await.expect("ok");
        assert_eq!(codec.decode::<i64>(&r).expect("decode"), 3);

        let req = RpcRequest::new("demo.Raw", "fail", vec![]);
        assert_eq!(mux.invoke(&req).await, Err("boom".to_string()));

        let req = RpcRequest::new("demo.Calc", "sub", vec![]);
        assert_eq!(mux.invoke(&req).await, Err("method not found: demo.Calc.sub".to_string()));

        let req = RpcRequest::new("demo.None", "add", vec![]);
        assert!(mux.invoke(&req).await.unwrap_err().starts_with("service not found"));

        let services = mux.services();
        assert_eq!(services[0], ("demo.Calc".to_string(), "demo::CalcImpl".to_string()));
        assert_eq!(services[1], ("demo.Raw".to_string(), "demo.Raw".to_string()));
    }
}
