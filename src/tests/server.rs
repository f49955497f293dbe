mod server_tests {
    use std::{
        error::Error,
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use http::{header, HeaderMap, StatusCode};
    use http_body_util::{BodyExt, Full};
    use hyper::client::conn::http1::{self, SendRequest};
    use hyper_util::rt::TokioIo;
    use tokio::{net::TcpStream, runtime::Handle, sync::mpsc, time::timeout};

    use crate::{
        config::{ListenerConfig, ServerConfig},
        errors::{ConfigError, RequestError, TetherError},
        tests::local_server,
        HandlerError, ListenerSource, Request, Server, DEFAULT_BACKLOG,
    };

    const WAIT: Duration = Duration::from_secs(5);

    async fn connect(addr: SocketAddr) -> Result<SendRequest<Full<Bytes>>, Box<dyn Error>> {
        let stream = TcpStream::connect(addr).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        Ok(sender)
    }

    fn request(method: &str, path: &str, body: &'static str) -> http::Request<Full<Bytes>> {
        http::Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .expect("valid request")
    }

    async fn send(
        sender: &mut SendRequest<Full<Bytes>>,
        request: http::Request<Full<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Bytes), Box<dyn Error>> {
        sender
            .ready()
            .await?;
        let response = timeout(WAIT, sender.send_request(request)).await??;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await?
            .to_bytes();
        Ok((parts.status, parts.headers, body))
    }

    fn first_addr(server: &Server) -> SocketAddr {
        server.local_addrs()[0]
    }

    fn forwarding_server() -> (Server, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = local_server(move |request| {
            tx.send(request)
                .map_err(|_| HandlerError::from("test receiver gone"))?;
            Ok(())
        });
        (server, rx)
    }

    #[tokio::test]
    async fn test_respond_ok() -> Result<(), Box<dyn Error>> {
        let server = local_server(|mut request| {
            request.respond(200, &[], "ok")?;
            Ok(())
        });
        assert_eq!(server.listener_count(), 1);
        assert!(!server.is_closed());

        let mut sender = connect(first_addr(&server)).await?;
        let (status, headers, body) = send(&mut sender, request("GET", "/", "")).await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"ok"));
        assert_eq!(headers[header::CONTENT_LENGTH], "2");
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_request_answers_500_and_connection_survives() -> Result<(), Box<dyn Error>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let server = local_server(move |mut request| {
            let method = request.method()?;
            let path = request.path()?;
            recorded
                .lock()
                .expect("test lock")
                .push((method, path.clone()));
            if path == "/x" {
                return Ok(());
            }
            request.respond(200, &[("content-type", "text/plain")], "still here")?;
            Ok(())
        });

        let mut sender = connect(first_addr(&server)).await?;

        let (status, _, body) = send(&mut sender, request("GET", "/x", "")).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, Bytes::from_static(b"No response"));

        let (status, _, body) = send(&mut sender, request("GET", "/y", "")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"still here"));

        let seen = seen
            .lock()
            .expect("test lock")
            .clone();
        assert_eq!(
            seen,
            vec![("GET".to_string(), "/x".to_string()), ("GET".to_string(), "/y".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_keep_alive_requests_in_order() -> Result<(), Box<dyn Error>> {
        let server = local_server(|mut request| {
            let body = format!("{} {} {:?}", request.method()?, request.path()?, request.payload()?);
            request.respond(200, &[], body)?;
            Ok(())
        });

        let mut sender = connect(first_addr(&server)).await?;

        let (_, _, first) = send(&mut sender, request("POST", "/first", "one")).await?;
        let (_, _, second) = send(&mut sender, request("GET", "/second", "")).await?;

        assert_eq!(first, Bytes::from_static(br#"POST /first Some(b"one")"#));
        assert_eq!(second, Bytes::from_static(b"GET /second None"));
        Ok(())
    }

    #[tokio::test]
    async fn test_callback_errors_are_swallowed() -> Result<(), Box<dyn Error>> {
        let server = local_server(|mut request| match request.path()?.as_str() {
            "/error" => Err(HandlerError::from("application failure")),
            "/panic" => panic!("application panic"),
            _ => {
                request.respond(200, &[], "ok")?;
                Ok(())
            }
        });

        let mut sender = connect(first_addr(&server)).await?;

        let (status, _, _) = send(&mut sender, request("GET", "/error", "")).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _, _) = send(&mut sender, request("GET", "/panic", "")).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _, body) = send(&mut sender, request("GET", "/ok", "")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"ok"));
        Ok(())
    }

    #[tokio::test]
    async fn test_header_rules_end_to_end() -> Result<(), Box<dyn Error>> {
        let server = local_server(|mut request| {
            let rejected = match request.respond(200, &[("x-request-id", "1")], "nope") {
                Err(e) => e.to_string(),
                Ok(()) => "accepted".to_string(),
            };
            request.respond(200, &[("Content-Type", "text/plain"), ("Content-Length", "99")], rejected)?;
            Ok(())
        });

        let mut sender = connect(first_addr(&server)).await?;
        let (status, headers, body) = send(&mut sender, request("GET", "/", "")).await?;

        let expected = "Request error: unknown header `x-request-id`";
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from(expected));
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], expected.len().to_string().as_str());
        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_response() -> Result<(), Box<dyn Error>> {
        let (server, mut requests) = forwarding_server();
        let addr = first_addr(&server);

        let client = tokio::spawn(async move {
            let mut sender = connect(addr)
                .await
                .map_err(|e| e.to_string())?;
            send(&mut sender, request("GET", "/later", ""))
                .await
                .map_err(|e| e.to_string())
        });

        let mut pending = timeout(WAIT, requests.recv())
            .await?
            .ok_or("no request dispatched")?;
        assert_eq!(pending.path()?, "/later");
        pending.respond(202, &[], "accepted")?;

        let (status, _, body) = client.await??;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Bytes::from_static(b"accepted"));
        Ok(())
    }

    #[tokio::test]
    async fn test_respond_after_close_fails() -> Result<(), Box<dyn Error>> {
        let (server, mut requests) = forwarding_server();
        let addr = first_addr(&server);

        let client = tokio::spawn(async move {
            let mut sender = connect(addr)
                .await
                .map_err(|e| e.to_string())?;
            send(&mut sender, request("GET", "/", ""))
                .await
                .map_err(|e| e.to_string())
        });

        let mut pending = timeout(WAIT, requests.recv())
            .await?
            .ok_or("no request dispatched")?;

        server.close();
        assert_eq!(
            pending.respond(200, &[], "too late"),
            Err(TetherError::Request(RequestError::ServerClosed))
        );
        assert!(pending.is_live());

        // Nobody can answer any more; the stream fails instead of hanging.
        drop(pending);
        let result = timeout(WAIT, client).await??;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_request_keeps_server_alive() -> Result<(), Box<dyn Error>> {
        let (server, mut requests) = forwarding_server();
        let addr = first_addr(&server);

        let client = tokio::spawn(async move {
            let mut sender = connect(addr)
                .await
                .map_err(|e| e.to_string())?;
            send(&mut sender, request("GET", "/", ""))
                .await
                .map_err(|e| e.to_string())
        });

        let mut pending = timeout(WAIT, requests.recv())
            .await?
            .ok_or("no request dispatched")?;

        drop(server);
        pending.respond(200, &[], "served after drop")?;
        drop(pending);

        let (status, _, body) = timeout(WAIT, client).await???;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"served after drop"));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_is_idempotent() -> Result<(), Box<dyn Error>> {
        let server = local_server(|_request| Ok(()));
        let addr = first_addr(&server);

        server.close();
        assert!(server.is_closed());
        assert_eq!(server.listener_count(), 0);
        assert!(server
            .local_addrs()
            .is_empty());

        server.close();
        assert_eq!(server.listener_count(), 0);

        timeout(WAIT, server.wait_closed()).await?;
        timeout(WAIT, server.wait_closed()).await?;

        assert!(TcpStream::connect(addr)
            .await
            .is_err());
        Ok(())
    }

    #[test]
    fn test_builder_requires_runtime() {
        let result = Server::builder()
            .listener(SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(|_request| Ok(()));
        assert!(matches!(result, Err(TetherError::Config(ConfigError::NoEventLoop))));
    }

    #[tokio::test]
    async fn test_empty_socket_list() {
        let result = Server::new(Vec::new(), &Handle::current(), |_request| Ok(()), None, DEFAULT_BACKLOG);
        assert!(matches!(result, Err(TetherError::Config(ConfigError::NoListeners))));
    }

    #[tokio::test]
    async fn test_bind_failure_reports_transport_error() -> Result<(), Box<dyn Error>> {
        let free = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
        let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
        let sockets = vec![ListenerSource::from(free), ListenerSource::from(taken.local_addr()?)];

        let result = Server::new(sockets, &Handle::current(), |_request| Ok(()), None, DEFAULT_BACKLOG);
        assert!(matches!(result, Err(TetherError::Connection(_))));

        // The listener opened before the failure releases its socket.
        let released = timeout(WAIT, async {
            while TcpStream::connect(free)
                .await
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "{} still accepts connections", free);
        Ok(())
    }

    async fn answer_later(mut request: Request) -> Result<(), HandlerError> {
        let path = request.path()?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        match path.as_str() {
            "/error" => Err(HandlerError::from("async failure")),
            "/panic" => panic!("async panic"),
            _ => {
                request.respond(200, &[], format!("later {}", path))?;
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_serve_async() -> Result<(), Box<dyn Error>> {
        let server = Server::builder()
            .listener(SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve_async(answer_later)?;

        let mut sender = connect(first_addr(&server)).await?;

        let (status, _, body) = send(&mut sender, request("GET", "/a", "")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"later /a"));

        let (status, _, body) = send(&mut sender, request("GET", "/error", "")).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, Bytes::from_static(b"No response"));

        let (status, _, _) = send(&mut sender, request("GET", "/panic", "")).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _, body) = send(&mut sender, request("GET", "/b", "")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"later /b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_body_answers_413() -> Result<(), Box<dyn Error>> {
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let recorded = dispatched.clone();
        let server = Server::builder()
            .listener(SocketAddr::from(([127, 0, 0, 1], 0)))
            .max_request_body(4)
            .serve(move |mut request| {
                recorded
                    .lock()
                    .expect("test lock")
                    .push(request.path()?);
                let body = request
                    .payload()?
                    .unwrap_or_default();
                request.respond(200, &[], body)?;
                Ok(())
            })?;

        let mut sender = connect(first_addr(&server)).await?;
        let (status, _, body) = send(&mut sender, request("POST", "/fits", "four")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"four"));

        let mut sender = connect(first_addr(&server)).await?;
        let (status, _, _) = send(&mut sender, request("POST", "/big", "too large")).await?;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let dispatched = dispatched
            .lock()
            .expect("test lock")
            .clone();
        assert_eq!(dispatched, vec!["/fits".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_bind_by_host() -> Result<(), Box<dyn Error>> {
        let server = Server::bind(
            "127.0.0.1",
            0,
            &Handle::current(),
            |mut request| {
                request.respond(200, &[], "bound")?;
                Ok(())
            },
            None,
            DEFAULT_BACKLOG,
        )?;
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0]
            .ip()
            .is_loopback());

        let mut sender = connect(addrs[0]).await?;
        let (_, _, body) = send(&mut sender, request("GET", "/", "")).await?;
        assert_eq!(body, Bytes::from_static(b"bound"));
        Ok(())
    }

    #[tokio::test]
    async fn test_from_config_without_keep_alive() -> Result<(), Box<dyn Error>> {
        let config = ServerConfig::builder()
            .add_listener(
                ListenerConfig::builder()
                    .interface("127.0.0.1")
                    .port(0)
                    .build()?,
            )
            .keep_alive(false)
            .build()?;

        let server = Server::from_config(&config, &Handle::current(), |mut request| {
            request.respond(200, &[], "bye")?;
            Ok(())
        })?;

        let mut sender = connect(first_addr(&server)).await?;
        let (status, _, body) = send(&mut sender, request("GET", "/", "")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"bye"));

        // The server hangs up after one exchange.
        assert!(send(&mut sender, request("GET", "/", ""))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_with_prebound_sockets() -> Result<(), Box<dyn Error>> {
        let listening = std::net::TcpListener::bind("127.0.0.1:0")?;
        let bound = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?;
        bound.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())?;

        let server = Server::builder()
            .listener(listening)
            .listener(bound)
            .backlog(8)
            .serialize_callbacks(false)
            .serve(|mut request| {
                let body = request.host()?;
                request.respond(200, &[], body)?;
                Ok(())
            })?;
        assert_eq!(server.listener_count(), 2);

        for addr in server.local_addrs() {
            let mut sender = connect(addr).await?;
            let (_, _, body) = send(&mut sender, request("GET", "/", "")).await?;
            assert_eq!(body, Bytes::from_static(b"localhost"));
        }
        Ok(())
    }
}
