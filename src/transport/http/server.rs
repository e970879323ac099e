use super::{CONTENT_TYPE_PAYLOAD, SERVICES_PATH};
use crate::Codec;
use crate::proto::{RpcRequest, RpcResponse};
use crate::server::{Responder, ServerCtx, ServerTransport, ServiceInvoker};
use bytes::Bytes;
use crossfire::MAsyncRx;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Serves requests over HTTP/1.1, with keep-alive.
pub struct HttpServer {
    listener: TcpListener,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "http server {:?}", self.listener.local_addr())
    }
}

impl ServerTransport for HttpServer {
    async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    #[inline]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn serve<I: ServiceInvoker, C: Codec>(self, ctx: Arc<ServerCtx<I, C>>, close_rx: MAsyncRx<()>) {
        loop {
            tokio::select! {
                r = self.listener.accept() => match r {
                    Ok((stream, peer)) => {
                        debug!("accept http conn from {}", peer);
                        tokio::spawn(serve_conn(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = close_rx.recv() => break,
            }
        }
        info!("{:?} exit", self);
    }
}

async fn serve_conn<I: ServiceInvoker, C: Codec>(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerCtx<I, C>>) {
    let close_rx = ctx.conn_close_rx();
    let svc_ctx = ctx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = svc_ctx.clone();
        async move { Ok::<_, Infallible>(handle_request(ctx, req).await) }
    });
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(ctx.config.idle_timeout())
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);
    tokio::select! {
        r = conn.as_mut() => {
            if let Err(e) = r {
                logger_debug!(ctx.logger, "http conn from {} closed: {}", peer, e);
            }
        }
        _ = close_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                logger_debug!(ctx.logger, "http conn from {} shutdown: {}", peer, e);
            }
        }
    }
    logger_debug!(ctx.logger, "http conn from {} exit", peer);
}

fn reply(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

#[inline]
fn bad_request(msg: &'static str) -> Response<Full<Bytes>> {
    reply(StatusCode::BAD_REQUEST, "text/plain", msg)
}

fn services_page(services: Vec<(String, String)>) -> String {
    let mut html = String::from("<ul>");
    for (key, location) in services {
        html.push_str(&format!("<li>{}: {}</li>", key, location));
    }
    html.push_str("</ul>");
    html
}

async fn handle_request<I: ServiceInvoker, C: Codec>(
    ctx: Arc<ServerCtx<I, C>>, req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    if parts.uri.path() == SERVICES_PATH && parts.method == Method::GET {
        return reply(StatusCode::OK, "text/html; charset=utf-8", services_page(ctx.invoker.services()));
    }
    if parts.method != Method::POST {
        return reply(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed");
    }
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            logger_debug!(ctx.logger, "read http body error: {}", e);
            return bad_request("read request error");
        }
    };
    if body.is_empty() {
        return bad_request("rpc request data empty");
    }
    let req: RpcRequest = match ctx.codec.decode(&body) {
        Ok(req) => req,
        Err(_) => {
            logger_warn!(ctx.logger, "undecodable http request of {} bytes", body.len());
            return bad_request("rpc request decode error");
        }
    };
    let resp = if req.is_ping() {
        logger_trace!(ctx.logger, "http recv ping");
        RpcResponse::pong()
    } else {
        let seq = req.seq;
        let (tx, rx) = oneshot::channel();
        ctx.handle_req(req, Responder::Reply(tx)).await;
        match rx.await {
            Ok(resp) => resp,
            Err(_) => RpcResponse::err(seq, "server closed"),
        }
    };
    match ctx.codec.encode(&resp) {
        Ok(buf) => reply(StatusCode::OK, CONTENT_TYPE_PAYLOAD, buf),
        Err(_) => {
            logger_warn!(ctx.logger, "encode {:?} error", resp);
            reply(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode response error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_page() {
        let page = services_page(vec![("demo.Echo".to_string(), "demo::EchoImpl".to_string())]);
        assert_eq!(page, "<ul><li>demo.Echo: demo::EchoImpl</li></ul>");
        assert_eq!(services_page(vec![]), "<ul></ul>");
    }
}
