use crate::relay::relay;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::framing::BAUD_RATE;
use protocol::proxy::{Ack, ConnectRequest, ErrorBody, PortInfo, ProxyStatus, SendRequest, SendResponse};
use serial_link::{list_serial_ports, DirectTransport, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Opens links by port name and enumerates candidate ports.
#[async_trait]
pub(crate) trait LinkFactory: Send + Sync {
    fn open(&self, port_name: &str) -> Box<dyn Transport>;

    async fn ports(&self) -> Result<Vec<PortInfo>, TransportError>;
}

pub(crate) struct SerialPorts;

#[async_trait]
impl LinkFactory for SerialPorts {
    fn open(&self, port_name: &str) -> Box<dyn Transport> {
        Box::new(DirectTransport::new(Some(port_name.to_string())))
    }

    async fn ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        list_serial_ports().await
    }
}

struct Link {
    transport: Box<dyn Transport>,
    port: String,
}

#[derive(Clone)]
pub(crate) struct ProxyState {
    factory: Arc<dyn LinkFactory>,
    link: Arc<Mutex<Option<Link>>>,
    // Readable while a send holds `link`.
    port: Arc<std::sync::Mutex<Option<String>>>,
    cancel: Arc<std::sync::Mutex<CancellationToken>>,
}

impl ProxyState {
    pub(crate) fn new(factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            factory,
            link: Arc::new(Mutex::new(None)),
            port: Arc::new(std::sync::Mutex::new(None)),
            cancel: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
        }
    }

    fn status(&self) -> ProxyStatus {
        let port = self
            .port
            .lock()
            .map(|port| port.clone())
            .unwrap_or_default();
        ProxyStatus {
            connected: port.is_some(),
            baudrate: port.as_ref().map(|_| BAUD_RATE),
            port,
        }
    }

    fn set_port(&self, port: Option<String>) {
        if let Ok(mut current) = self.port.lock() {
            *current = port;
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Opens `port_name`, replacing any existing link.
    pub(crate) async fn connect(&self, port_name: &str) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if let Some(mut previous) = link.take() {
            previous.transport.disconnect().await;
            self.set_port(None);
            tracing::info!(event = "proxy.replaced", port = %previous.port);
        }
        let mut transport = self.factory.open(port_name);
        transport.connect().await?;
        *link = Some(Link {
            transport,
            port: port_name.to_string(),
        });
        self.set_port(Some(port_name.to_string()));
        tracing::info!(event = "proxy.connected", port = %port_name);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        let status = match err {
            TransportError::NotConnected => StatusCode::CONFLICT,
            TransportError::PortUnavailable(_) | TransportError::Connect(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

pub(crate) fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/ports", get(ports))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/send", post(send))
        .route("/cancel", post(cancel))
        .route("/reset", post(reset))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        "http request"
    );
    response
}

async fn root(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "serial-proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": state.status(),
    }))
}

async fn status(State(state): State<ProxyState>) -> Json<ProxyStatus> {
    Json(state.status())
}

async fn ports(State(state): State<ProxyState>) -> Result<Json<Vec<PortInfo>>, ApiError> {
    Ok(Json(state.factory.ports().await?))
}

async fn connect(
    State(state): State<ProxyState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<Ack>, ApiError> {
    let port_name = request.port_name.trim();
    if port_name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "port_name must not be empty"));
    }
    state.connect(port_name).await?;
    Ok(Json(Ack::ok(format!("connected to {port_name}"))))
}

async fn disconnect(State(state): State<ProxyState>) -> Json<Ack> {
    let mut link = state.link.lock().await;
    match link.take() {
        Some(mut previous) => {
            previous.transport.disconnect().await;
            state.set_port(None);
            tracing::info!(event = "proxy.disconnected", port = %previous.port);
            Json(Ack::ok(format!("disconnected from {}", previous.port)))
        }
        None => Json(Ack::ok("not connected")),
    }
}

async fn send(
    State(state): State<ProxyState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    if !request.timeout.is_finite() || request.timeout < 0.0 {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("invalid timeout {}", request.timeout),
        ));
    }
    let cancel = state.cancel_token();
    let mut link = state.link.lock().await;
    let Some(link) = link.as_mut() else {
        return Err(TransportError::NotConnected.into());
    };
    let window = Duration::from_secs_f64(request.timeout);
    match relay(
        link.transport.as_mut(),
        &request.command,
        window,
        request.max_retries,
        &cancel,
    )
    .await
    {
        Ok(response) => Ok(Json(response)),
        Err(TransportError::Cancelled) => {
            tracing::info!(event = "proxy.send_cancelled", command = %request.command);
            Ok(Json(SendResponse::cancelled()))
        }
        Err(err) => {
            tracing::warn!(event = "proxy.send_failed", command = %request.command, error = %err);
            Err(err.into())
        }
    }
}

async fn cancel(State(state): State<ProxyState>) -> Json<Ack> {
    state.cancel_token().cancel();
    tracing::info!(event = "proxy.cancel_requested");
    Json(Ack::ok("cancel requested"))
}

async fn reset(State(state): State<ProxyState>) -> Json<Ack> {
    match state.cancel.lock() {
        Ok(mut token) => *token = CancellationToken::new(),
        Err(poisoned) => *poisoned.into_inner() = CancellationToken::new(),
    }
    Json(Ack::ok("ready"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_engine::{RetryPolicy, SequenceExecutor};
    use protocol::config::ScriptedResponse;
    use protocol::{CommandStep, SequenceStatus};
    use serial_link::{RemoteTransport, SentJournal, SimulatedTransport};

    struct ScriptedPorts {
        script: Vec<ScriptedResponse>,
        journal: std::sync::Mutex<Option<SentJournal>>,
    }

    impl ScriptedPorts {
        fn new(script: Vec<ScriptedResponse>) -> Arc<Self> {
            Arc::new(Self {
                script,
                journal: std::sync::Mutex::new(None),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.journal
                .lock()
                .expect("journal")
                .as_ref()
                .map(SentJournal::sent)
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl LinkFactory for ScriptedPorts {
        fn open(&self, _port_name: &str) -> Box<dyn Transport> {
            let link = SimulatedTransport::new().with_script("default", self.script.clone());
            *self.journal.lock().expect("journal") = Some(link.journal());
            Box::new(link)
        }

        async fn ports(&self) -> Result<Vec<PortInfo>, TransportError> {
            Ok(vec![PortInfo {
                device: "/dev/ttyUSB0".to_string(),
                description: "CH340".to_string(),
            }])
        }
    }

    fn request(command: &str, timeout: f64) -> Json<SendRequest> {
        Json(SendRequest {
            command: command.to_string(),
            timeout,
            max_retries: 1,
        })
    }

    async fn connected(factory: Arc<ScriptedPorts>) -> ProxyState {
        let state = ProxyState::new(factory);
        state.connect("/dev/ttyUSB0").await.expect("connect");
        state
    }

    #[tokio::test(start_paused = true)]
    async fn send_relays_the_reply() {
        let factory = ScriptedPorts::new(vec![ScriptedResponse::reply("(ISNN)", 100)]);
        let state = connected(factory.clone()).await;
        let Json(response) = send(State(state), request("(IBNP)", 2.0)).await.expect("send");
        assert!(response.success);
        assert_eq!(response.responses, vec!["(ISNN)"]);
        assert_eq!(factory.sent(), vec!["(IBNP)"]);
    }

    #[tokio::test]
    async fn send_without_link_is_a_conflict() {
        let state = ProxyState::new(ScriptedPorts::new(Vec::new()));
        let err = send(State(state), request("(IBNP)", 1.0))
            .await
            .expect_err("not connected");
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn negative_timeout_is_rejected() {
        let state = connected(ScriptedPorts::new(Vec::new())).await;
        let err = send(State(state), request("(IBNP)", -1.0))
            .await
            .expect_err("invalid");
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_sends_until_reset() {
        let factory = ScriptedPorts::new(vec![
            ScriptedResponse::silent(),
            ScriptedResponse::reply("(OK)", 50),
        ]);
        let state = connected(factory.clone()).await;

        let in_flight = tokio::spawn(send(State(state.clone()), request("(IBNP)", 30.0)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Json(ack) = cancel(State(state.clone())).await;
        assert!(ack.success);
        let Json(response) = in_flight.await.expect("join").expect("send");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("cancelled"));

        let Json(refused) = send(State(state.clone()), request("(IBNP)", 1.0))
            .await
            .expect("send");
        assert_eq!(refused.error.as_deref(), Some("cancelled"));

        let Json(ack) = reset(State(state.clone())).await;
        assert!(ack.success);
        let Json(response) = send(State(state), request("(IBNP)", 1.0)).await.expect("send");
        assert!(response.success);
        assert_eq!(response.received_data, "(OK)");
    }

    #[tokio::test]
    async fn connect_replaces_the_previous_link() {
        let state = connected(ScriptedPorts::new(Vec::new())).await;
        connect(
            State(state.clone()),
            Json(ConnectRequest {
                port_name: "/dev/ttyUSB1".to_string(),
            }),
        )
        .await
        .expect("connect");
        let Json(status) = status(State(state.clone())).await;
        assert!(status.connected);
        assert_eq!(status.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(status.baudrate, Some(9600));

        let Json(ack) = disconnect(State(state.clone())).await;
        assert_eq!(ack.message, "disconnected from /dev/ttyUSB1");
        let Json(status) = super::status(State(state)).await;
        assert!(!status.connected);
        assert_eq!(status.baudrate, None);
    }

    #[tokio::test]
    async fn ports_come_from_the_factory() {
        let state = ProxyState::new(ScriptedPorts::new(Vec::new()));
        let Json(listed) = ports(State(state)).await.expect("ports");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "CH340");
    }

    async fn serve(state: ProxyState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        format!("http://{addr}/")
    }

    fn remote_executor(base_url: &str) -> SequenceExecutor {
        let transport = RemoteTransport::new(
            base_url,
            Some("/dev/ttyUSB0".to_string()),
            1,
            Duration::from_secs(5),
        )
        .expect("remote transport");
        SequenceExecutor::new(Box::new(transport), RetryPolicy::default())
    }

    fn close_steps() -> Vec<CommandStep> {
        vec![CommandStep::new("(IBNP)", Some("(ISNN)"), 3.0)]
    }

    #[tokio::test]
    async fn sequence_runs_through_the_proxy() {
        let factory = ScriptedPorts::new(vec![
            ScriptedResponse::reply("(ISNN)", 50),
            ScriptedResponse::reply("(15000)", 50),
        ]);
        let base_url = serve(ProxyState::new(factory.clone())).await;
        let mut executor = remote_executor(&base_url);
        let steps = vec![
            CommandStep::new("(IBNP)", Some("(ISNN)"), 1.0),
            CommandStep::new("(IWRP)", None, 1.0),
        ];

        let report = executor
            .run("close", &steps, None, &CancellationToken::new())
            .await;
        assert!(report.is_completed(), "{:?}", report.failure);
        assert_eq!(report.weights.len(), 1);
        assert_eq!(report.weights[0].grams, 15000);
        assert_eq!(factory.sent(), vec!["(IBNP)", "(IWRP)"]);
    }

    #[tokio::test]
    async fn executor_cancel_aborts_the_request_and_cancels_the_proxy() {
        let factory = ScriptedPorts::new(vec![ScriptedResponse::silent()]);
        let state = ProxyState::new(factory.clone());
        let base_url = serve(state.clone()).await;
        let mut executor = remote_executor(&base_url);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let report = executor.run("close", &close_steps(), None, &cancel).await;

        assert_eq!(report.status, SequenceStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(state.cancel_token().is_cancelled());
        assert_eq!(factory.sent(), vec!["(IBNP)"]);
    }

    #[tokio::test]
    async fn proxy_side_cancel_is_not_retried() {
        let factory = ScriptedPorts::new(vec![ScriptedResponse::silent()]);
        let state = ProxyState::new(factory.clone());
        let base_url = serve(state.clone()).await;
        let mut executor = remote_executor(&base_url);

        let operator = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cancel(State(operator)).await;
        });
        let started = std::time::Instant::now();
        let report = executor
            .run("close", &close_steps(), None, &CancellationToken::new())
            .await;

        assert_eq!(report.status, SequenceStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(factory.sent(), vec!["(IBNP)"]);
    }
}
