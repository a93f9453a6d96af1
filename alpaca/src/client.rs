//! Alpaca Transaction Engine
//!
//! Every Alpaca call goes through [`AlpacaClient::execute`]: allocate the
//! transaction identifiers, send the request (retrying connection failures and
//! timeouts), then decode the response envelope or negotiate the image array
//! transfer mode.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::imagebytes::ImageBytesFrame;
use crate::{
    create_transport, decode_response, translate, AlpacaEndpoint, AlpacaError, ClientIdentity, ConnectionConfig,
    Envelope, HandOffDescriptor, HttpRequest, HttpResponse, HttpTransport, HttpVerb, ImageArray,
    ImageArrayTransferType, JsonCasing, ResponseType, ResponseValue, StateValue, TransactionIds, TransferMode,
    TransportError, VariantArray, ALPACA_API_VERSION, BASE64_HANDOFF_HEADER, BASE64_HANDOFF_SUFFIX,
};

/// Timeout configuration for different operation types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for quick status queries (e.g., connected, position)
    pub quick_query_ms: u64,
    /// Timeout for standard operations
    pub standard_operation_ms: u64,
    /// Timeout for long operations (e.g., image download)
    pub long_operation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_query_ms: 5000,
            standard_operation_ms: 30000,
            long_operation_ms: 300000,
        }
    }
}

impl TimeoutConfig {
    pub fn quick_query(&self) -> Duration {
        Duration::from_millis(self.quick_query_ms)
    }

    pub fn standard_operation(&self) -> Duration {
        Duration::from_millis(self.standard_operation_ms)
    }

    pub fn long_operation(&self) -> Duration {
        Duration::from_millis(self.long_operation_ms)
    }
}

/// Retry configuration for failed requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Everything a client is built from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub image_array_transfer: ImageArrayTransferType,
    pub json_casing: JsonCasing,
}

/// Alpaca API version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
        }
    }

    pub fn number(&self) -> u32 {
        match self {
            ApiVersion::V1 => ALPACA_API_VERSION,
        }
    }
}

/// The transport currently in use and the settings it was built from
struct Connection {
    config: ConnectionConfig,
    transport: Arc<dyn HttpTransport>,
}

/// Alpaca client for communicating with one device
pub struct AlpacaClient {
    endpoint: AlpacaEndpoint,
    identity: ClientIdentity,
    timeout_config: TimeoutConfig,
    retry_config: RetryConfig,
    image_array_transfer: ImageArrayTransferType,
    json_casing: JsonCasing,
    connection: RwLock<Connection>,
}

impl AlpacaClient {
    /// Create a new Alpaca client for a device with default configuration
    pub fn new(endpoint: AlpacaEndpoint) -> Result<Self, AlpacaError> {
        AlpacaClientBuilder::new(endpoint).build()
    }

    /// Create a new Alpaca client with a custom configuration
    pub fn with_config(endpoint: AlpacaEndpoint, config: ClientConfig) -> Result<Self, AlpacaError> {
        AlpacaClientBuilder::new(endpoint).config(config).build()
    }

    pub fn endpoint(&self) -> &AlpacaEndpoint {
        &self.endpoint
    }

    pub fn client_id(&self) -> u32 {
        self.identity.client_id()
    }

    /// Last transaction id issued by this client, 0 if none yet
    pub fn last_transaction_id(&self) -> u32 {
        self.identity.last_transaction_id()
    }

    /// Get the timeout configuration
    pub fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout_config
    }

    /// Get the retry configuration
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    pub fn image_array_transfer(&self) -> ImageArrayTransferType {
        self.image_array_transfer
    }

    pub fn json_casing(&self) -> JsonCasing {
        self.json_casing
    }

    /// Settings of the transport currently in use
    pub async fn connection_config(&self) -> ConnectionConfig {
        self.connection.read().await.config.clone()
    }

    /// Build a new transport and use it for every call that starts afterwards.
    /// Calls already in flight finish on the transport they started with.
    pub async fn reconfigure(&self, config: ConnectionConfig) -> Result<(), AlpacaError> {
        let transport = create_transport(&config)?;
        let mut connection = self.connection.write().await;
        *connection = Connection { config, transport };
        debug!("Reconfigured connection to {}", self.endpoint);
        Ok(())
    }

    async fn transport(&self) -> Arc<dyn HttpTransport> {
        self.connection.read().await.transport.clone()
    }

    /// Issue one Alpaca call and decode its `Value` as `response_type`.
    ///
    /// The member name is lower-cased into the device URL. `params` follow the
    /// `ClientID` and `ClientTransactionID` parameters in the given order, as
    /// query parameters for GET and as a form body for PUT. `timeout` bounds
    /// each attempt.
    pub async fn execute(
        &self,
        method: &str,
        verb: HttpVerb,
        params: &[(&str, &str)],
        response_type: ResponseType,
        timeout: Duration,
    ) -> Result<ResponseValue, AlpacaError> {
        let url = self.endpoint.method_url(method);
        self.transact(method, url, verb, params, response_type, timeout).await
    }

    async fn transact(
        &self,
        method: &str,
        url: String,
        verb: HttpVerb,
        params: &[(&str, &str)],
        response_type: ResponseType,
        timeout: Duration,
    ) -> Result<ResponseValue, AlpacaError> {
        let ids = self.identity.begin();
        let transport = self.transport().await;

        let mut pairs = Vec::from(ids.as_params());
        pairs.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let (query, form) = match verb {
            HttpVerb::Get => (pairs, Vec::new()),
            HttpVerb::Put => (Vec::new(), pairs),
        };
        let headers = if response_type == ResponseType::ImageArray {
            self.image_array_transfer.request_headers()
        } else {
            Vec::new()
        };
        let request = HttpRequest {
            verb,
            url,
            query,
            form,
            headers,
            timeout,
        };

        debug!(
            "{} {} (client {}, transaction {})",
            verb.as_str(),
            request.url,
            ids.client_id,
            ids.client_transaction_id
        );

        let (response, sent_at) = self.send_with_retry(method, transport.as_ref(), &request).await?;
        trace!(
            "{} returned HTTP {} with {} bytes after {}ms",
            method,
            response.status,
            response.body.len(),
            sent_at.elapsed().as_millis()
        );

        if !response.is_success() {
            return Err(AlpacaError::HttpStatus {
                method: method.to_string(),
                status: response.status,
                body: response.text(),
            });
        }

        if response_type == ResponseType::ImageArray {
            let array = self
                .decode_image_array(method, transport.as_ref(), &request, ids, &response, sent_at)
                .await?;
            Ok(ResponseValue::ImageArray(array))
        } else {
            decode_response(method, response_type, &response.body, self.json_casing)
        }
    }

    /// Send with retry on connection failures and timeouts. Returns the
    /// response and the instant its successful attempt started.
    async fn send_with_retry(
        &self,
        method: &str,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
    ) -> Result<(HttpResponse, Instant), AlpacaError> {
        let max_attempts = self.retry_config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            let error = match tokio::time::timeout(request.timeout, transport.send(request)).await {
                Ok(Ok(response)) => return Ok((response, started)),
                Ok(Err(e)) => transport_failure(method, &request.url, request.timeout, e),
                Err(_) => AlpacaError::timeout(method, request.timeout.as_millis() as u64),
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= max_attempts {
                if max_attempts > 1 {
                    warn!("{} failed after {} attempts: {}", method, max_attempts, error);
                }
                return Err(error);
            }

            let delay = self.retry_config.delay();
            debug!(
                "Request failed (attempt {}/{}), retrying in {:?}: {}",
                attempt, max_attempts, delay, error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn decode_image_array(
        &self,
        method: &str,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
        ids: TransactionIds,
        response: &HttpResponse,
        sent_at: Instant,
    ) -> Result<ImageArray, AlpacaError> {
        let handoff = response.header(BASE64_HANDOFF_HEADER).is_some();
        let mode = TransferMode::select(response.content_type(), handoff)
            .map_err(|e| AlpacaError::malformed(method, e))?;
        debug!("{} image array transfer mode {:?}", method, mode);

        match mode {
            TransferMode::Json => {
                match decode_response(method, ResponseType::ImageArray, &response.body, self.json_casing)? {
                    ResponseValue::ImageArray(array) => Ok(array),
                    other => Err(AlpacaError::malformed(
                        method,
                        format!("expected an image array, decoded {:?}", other.response_type()),
                    )),
                }
            }
            TransferMode::ImageBytes => decode_image_bytes(method, &response.body),
            TransferMode::Base64HandOff => {
                self.fetch_handoff(method, transport, request, ids, &response.body, sent_at)
                    .await
            }
        }
    }

    /// Second leg of a base64 hand-off. Not retried: the call's deadline is
    /// already partly spent.
    async fn fetch_handoff(
        &self,
        method: &str,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
        ids: TransactionIds,
        body: &[u8],
        sent_at: Instant,
    ) -> Result<ImageArray, AlpacaError> {
        let envelope =
            Envelope::parse(body, self.json_casing).map_err(|e| AlpacaError::malformed(method, e))?;
        envelope.check(method)?;
        let descriptor = HandOffDescriptor::from_envelope(&envelope).map_err(|e| AlpacaError::malformed(method, e))?;

        let remaining = request.timeout.saturating_sub(sent_at.elapsed());
        if remaining.is_zero() {
            return Err(AlpacaError::timeout(method, request.timeout.as_millis() as u64));
        }

        let follow_up = HttpRequest {
            verb: HttpVerb::Get,
            url: format!("{}/{}", request.url, BASE64_HANDOFF_SUFFIX),
            query: Vec::from(ids.as_params()),
            form: Vec::new(),
            headers: Vec::new(),
            timeout: remaining,
        };
        debug!(
            "{} fetching {:?} {:?} array from {}",
            method, descriptor.element_type, descriptor.dimensions, follow_up.url
        );

        let response = match tokio::time::timeout(remaining, transport.send(&follow_up)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(transport_failure(method, &follow_up.url, remaining, e)),
            Err(_) => return Err(AlpacaError::timeout(method, remaining.as_millis() as u64)),
        };
        if !response.is_success() {
            return Err(AlpacaError::HttpStatus {
                method: method.to_string(),
                status: response.status,
                body: response.text(),
            });
        }
        trace!("{} base64 payload is {} bytes", method, response.body.len());

        descriptor
            .decode_payload(&response.body)
            .map_err(|e| AlpacaError::malformed(method, e))
    }

    // Typed helpers

    /// GET with the standard timeout
    pub async fn get(&self, method: &str, response_type: ResponseType) -> Result<ResponseValue, AlpacaError> {
        let timeout = self.timeout_config.standard_operation();
        self.execute(method, HttpVerb::Get, &[], response_type, timeout).await
    }

    /// GET with the quick query timeout
    pub async fn get_quick(&self, method: &str, response_type: ResponseType) -> Result<ResponseValue, AlpacaError> {
        let timeout = self.timeout_config.quick_query();
        self.execute(method, HttpVerb::Get, &[], response_type, timeout).await
    }

    /// PUT with the standard timeout
    pub async fn put(
        &self,
        method: &str,
        params: &[(&str, &str)],
        response_type: ResponseType,
    ) -> Result<ResponseValue, AlpacaError> {
        let timeout = self.timeout_config.standard_operation();
        self.execute(method, HttpVerb::Put, params, response_type, timeout).await
    }

    pub async fn get_bool(&self, method: &str) -> Result<bool, AlpacaError> {
        let value = self.get(method, ResponseType::Bool).await?;
        expect_type(method, value.as_bool())
    }

    pub async fn get_i32(&self, method: &str) -> Result<i32, AlpacaError> {
        let value = self.get(method, ResponseType::Int32).await?;
        expect_type(method, value.as_i32())
    }

    pub async fn get_f64(&self, method: &str) -> Result<f64, AlpacaError> {
        let value = self.get(method, ResponseType::Double).await?;
        expect_type(method, value.as_f64())
    }

    pub async fn get_string(&self, method: &str) -> Result<String, AlpacaError> {
        let value = self.get(method, ResponseType::String).await?;
        expect_type(method, value.into_string())
    }

    pub async fn get_string_list(&self, method: &str) -> Result<Vec<String>, AlpacaError> {
        let value = self.get(method, ResponseType::StringList).await?;
        expect_type(method, value.into_string_list())
    }

    /// PUT a member that returns nothing
    pub async fn put_none(&self, method: &str, params: &[(&str, &str)]) -> Result<(), AlpacaError> {
        self.put(method, params, ResponseType::None).await.map(|_| ())
    }

    // Common device members

    /// Check if the device is connected
    pub async fn connected(&self) -> Result<bool, AlpacaError> {
        let value = self.get_quick("connected", ResponseType::Bool).await?;
        expect_type("connected", value.as_bool())
    }

    /// Connect to or disconnect from the device
    pub async fn set_connected(&self, connected: bool) -> Result<(), AlpacaError> {
        self.put_none("connected", &[("Connected", bool_param(connected))]).await
    }

    pub async fn name(&self) -> Result<String, AlpacaError> {
        self.get_string("name").await
    }

    pub async fn description(&self) -> Result<String, AlpacaError> {
        self.get_string("description").await
    }

    pub async fn driver_info(&self) -> Result<String, AlpacaError> {
        self.get_string("driverinfo").await
    }

    pub async fn driver_version(&self) -> Result<String, AlpacaError> {
        self.get_string("driverversion").await
    }

    pub async fn interface_version(&self) -> Result<i16, AlpacaError> {
        match self.get("interfaceversion", ResponseType::Int16).await? {
            ResponseValue::Int16(v) => Ok(v),
            _ => Err(wrong_type("interfaceversion")),
        }
    }

    pub async fn supported_actions(&self) -> Result<Vec<String>, AlpacaError> {
        self.get_string_list("supportedactions").await
    }

    /// Invoke a driver specific action
    pub async fn action(&self, action: &str, parameters: &str) -> Result<String, AlpacaError> {
        let value = self
            .put("action", &[("Action", action), ("Parameters", parameters)], ResponseType::String)
            .await?;
        expect_type("action", value.into_string())
    }

    pub async fn command_blind(&self, command: &str, raw: bool) -> Result<(), AlpacaError> {
        self.put_none("commandblind", &[("Command", command), ("Raw", bool_param(raw))])
            .await
    }

    pub async fn command_bool(&self, command: &str, raw: bool) -> Result<bool, AlpacaError> {
        let value = self
            .put("commandbool", &[("Command", command), ("Raw", bool_param(raw))], ResponseType::Bool)
            .await?;
        expect_type("commandbool", value.as_bool())
    }

    pub async fn command_string(&self, command: &str, raw: bool) -> Result<String, AlpacaError> {
        let value = self
            .put("commandstring", &[("Command", command), ("Raw", bool_param(raw))], ResponseType::String)
            .await?;
        expect_type("commandstring", value.into_string())
    }

    /// Operational state snapshot as Name/Value pairs
    pub async fn device_state(&self) -> Result<Vec<StateValue>, AlpacaError> {
        let value = self.get("devicestate", ResponseType::StateList).await?;
        expect_type("devicestate", value.into_state_list())
    }

    /// Download the camera image array with the long operation timeout
    pub async fn image_array(&self) -> Result<ImageArray, AlpacaError> {
        let timeout = self.timeout_config.long_operation();
        let value = self
            .execute("imagearray", HttpVerb::Get, &[], ResponseType::ImageArray, timeout)
            .await?;
        expect_type("imagearray", value.into_image_array())
    }

    /// Download the camera image array with every element boxed
    pub async fn image_array_variant(&self) -> Result<VariantArray, AlpacaError> {
        let array = self.image_array().await?;
        Ok(array.to_variant_array())
    }

    // Management API

    /// API versions the server supports
    pub async fn api_versions(&self) -> Result<Vec<u32>, AlpacaError> {
        let url = self.endpoint.management_url("apiversions");
        let timeout = self.timeout_config.quick_query();
        let value = self
            .transact("apiversions", url, HttpVerb::Get, &[], ResponseType::Int32List, timeout)
            .await?;
        expect_type("apiversions", value.into_int32_list())?
            .into_iter()
            .map(|v| u32::try_from(v).map_err(|_| AlpacaError::malformed("apiversions", format!("negative version {}", v))))
            .collect()
    }

    /// Negotiate the best API version to use with the server
    pub async fn negotiate_api_version(&self) -> Result<ApiVersion, AlpacaError> {
        let versions = match self.api_versions().await {
            Ok(versions) => versions,
            Err(e @ (AlpacaError::HttpStatus { .. } | AlpacaError::MalformedResponse { .. })) => {
                // Servers without the management API only speak v1
                warn!("Failed to detect API versions, assuming v1: {}", e);
                vec![ALPACA_API_VERSION]
            }
            Err(e) => return Err(e),
        };

        if versions.contains(&ApiVersion::V1.number()) {
            Ok(ApiVersion::V1)
        } else {
            Err(AlpacaError::Configuration(format!(
                "Server supports versions {:?}, but client only supports v1",
                versions
            )))
        }
    }
}

fn decode_image_bytes(method: &str, body: &[u8]) -> Result<ImageArray, AlpacaError> {
    let frame = ImageBytesFrame::parse(body).map_err(|e| AlpacaError::malformed(method, e))?;
    if frame.is_error() {
        return Err(AlpacaError::Device {
            method: method.to_string(),
            fault: translate(frame.metadata.error_number, &frame.error_message()),
            client_transaction_id: frame.metadata.client_transaction_id,
            server_transaction_id: frame.metadata.server_transaction_id,
        });
    }
    trace!("{} ImageBytes payload is {} bytes", method, frame.payload.len());
    frame.to_array().map_err(|e| AlpacaError::malformed(method, e))
}

fn transport_failure(method: &str, url: &str, timeout: Duration, error: TransportError) -> AlpacaError {
    match error {
        TransportError::Timeout => AlpacaError::timeout(method, timeout.as_millis() as u64),
        TransportError::Connection(cause) => AlpacaError::Transport {
            method: method.to_string(),
            url: url.to_string(),
            cause,
        },
        TransportError::Other(cause) => AlpacaError::Request {
            method: method.to_string(),
            cause,
        },
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn wrong_type(method: &str) -> AlpacaError {
    AlpacaError::malformed(method, "decoded value has an unexpected type")
}

fn expect_type<T>(method: &str, value: Option<T>) -> Result<T, AlpacaError> {
    value.ok_or_else(|| wrong_type(method))
}

/// Builder for creating AlpacaClient with custom configuration
pub struct AlpacaClientBuilder {
    endpoint: AlpacaEndpoint,
    config: ClientConfig,
    client_id: Option<u32>,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl AlpacaClientBuilder {
    pub fn new(endpoint: AlpacaEndpoint) -> Self {
        Self {
            endpoint,
            config: ClientConfig::default(),
            client_id: None,
            transport: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.connection.username = username.into();
        self.config.connection.password = password.into();
        self
    }

    pub fn accept_invalid_certificates(mut self, accept: bool) -> Self {
        self.config.connection.accept_invalid_certificates = accept;
        self
    }

    pub fn timeout_config(mut self, config: TimeoutConfig) -> Self {
        self.config.timeouts = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    pub fn quick_query_timeout(mut self, ms: u64) -> Self {
        self.config.timeouts.quick_query_ms = ms;
        self
    }

    pub fn standard_timeout(mut self, ms: u64) -> Self {
        self.config.timeouts.standard_operation_ms = ms;
        self
    }

    pub fn long_timeout(mut self, ms: u64) -> Self {
        self.config.timeouts.long_operation_ms = ms;
        self
    }

    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.config.connection.connect_timeout_ms = ms;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, ms: u64) -> Self {
        self.config.retry.delay_ms = ms;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.config.retry = RetryConfig::no_retry();
        self
    }

    pub fn image_array_transfer(mut self, transfer: ImageArrayTransferType) -> Self {
        self.config.image_array_transfer = transfer;
        self
    }

    pub fn json_casing(mut self, casing: JsonCasing) -> Self {
        self.config.json_casing = casing;
        self
    }

    /// Use a fixed client id instead of a random one
    pub fn client_id(mut self, client_id: u32) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Send through the given transport instead of building one from the connection config
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<AlpacaClient, AlpacaError> {
        let ClientConfig {
            connection,
            timeouts,
            retry,
            image_array_transfer,
            json_casing,
        } = self.config;

        if retry.max_attempts == 0 {
            return Err(AlpacaError::Configuration("max_attempts must be at least 1".to_string()));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => create_transport(&connection)?,
        };
        let identity = match self.client_id {
            Some(id) => ClientIdentity::with_client_id(id),
            None => ClientIdentity::random(),
        };

        debug!("Created Alpaca client {} for {}", identity.client_id(), self.endpoint);

        Ok(AlpacaClient {
            endpoint: self.endpoint,
            identity,
            timeout_config: timeouts,
            retry_config: retry,
            image_array_transfer,
            json_casing,
            connection: RwLock::new(Connection {
                config: connection,
                transport,
            }),
        })
    }
}
