//!
//! Electrum protocol client over a plain TCP connection.
//!
//! Requests are newline-delimited JSON-RPC 2.0 messages. A single reader task owns the read half
//! of the connection, routes responses to the waiting request by id and hands subscription
//! notifications to the registered callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::{Transaction, Txid};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::*;
use crate::btc::blockchain::{
	ChainBackend, ChainError, Header, HeaderCallback, StatusCallback, TxHistoryEntry,
};

/// Protocol version requested in the `server.version` handshake.
const PROTOCOL_VERSION: &str = "1.4";

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, ChainError>>>;

struct ClientInner {
	writer: tokio::sync::Mutex<Writer>,
	next_id: AtomicU64,
	pending: Mutex<PendingMap>,
	status_callbacks: Mutex<HashMap<String, StatusCallback>>,
	header_callbacks: Mutex<Vec<HeaderCallback>>,
	closed: AtomicBool,
	request_timeout: Duration,
}

/// Electrum server connection.
#[derive(Clone)]
pub struct ElectrumClient {
	inner: Arc<ClientInner>,
	reader: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ElectrumClient {
	/// Connect to an Electrum server and perform the version handshake.
	///
	/// # Arguments
	/// * `server` - `host:port` of the server.
	/// * `request_timeout` - Time after which an unanswered request fails with `Timeout`.
	///
	/// # Returns
	/// A connected client, or a `ChainError` if the connection or handshake fails.
	pub async fn connect(server: &str, request_timeout: Duration) -> Result<Self, ChainError> {
		info!("Connecting to Electrum server {}", server);
		let stream = tokio::time::timeout(request_timeout, TcpStream::connect(server))
			.await
			.map_err(|_| ChainError::Connection(format!("connecting to {} timed out", server)))?
			.map_err(|e| ChainError::Connection(format!("{}: {}", server, e)))?;
		let (read_half, write_half) = stream.into_split();
		let client = Self::from_io(read_half, write_half, request_timeout);
		let version = client
			.request(
				methods::SERVER_VERSION,
				vec![json!("wallet-sync"), json!(PROTOCOL_VERSION)],
			)
			.await?;
		info!("Connected to {}, server version {}", server, version);
		Ok(client)
	}

	/// Wrap an established connection. Spawns the reader task, so this must run inside a tokio
	/// runtime.
	pub fn from_io<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let inner = Arc::new(ClientInner {
			writer: tokio::sync::Mutex::new(Box::new(writer)),
			next_id: AtomicU64::new(0),
			pending: Mutex::new(HashMap::new()),
			status_callbacks: Mutex::new(HashMap::new()),
			header_callbacks: Mutex::new(Vec::new()),
			closed: AtomicBool::new(false),
			request_timeout,
		});
		let handle = tokio::spawn(read_loop(inner.clone(), reader));
		Self {
			inner,
			reader: Arc::new(Mutex::new(Some(handle))),
		}
	}

	/// Send a request and wait for its result.
	///
	/// # Errors
	/// `Rpc` if the server answered with an error, `Timeout` if it did not answer in time and
	/// `Closed` if the connection is gone.
	pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(ChainError::Closed);
		}
		let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.inner.pending.lock().insert(id, tx);

		let mut line = serde_json::to_string(&Request::new(id, method, params))?;
		line.push('\n');
		debug!(id, method, "Sending Electrum request");
		{
			let mut writer = self.inner.writer.lock().await;
			let written = async {
				writer.write_all(line.as_bytes()).await?;
				writer.flush().await
			}
			.await;
			if let Err(e) = written {
				self.inner.pending.lock().remove(&id);
				return Err(e.into());
			}
		}

		match tokio::time::timeout(self.inner.request_timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(ChainError::Closed),
			Err(_) => {
				self.inner.pending.lock().remove(&id);
				warn!(id, method, "Electrum request timed out");
				Err(ChainError::Timeout)
			}
		}
	}

	fn parse_header(height: u64, header_hex: &str) -> Result<Header, ChainError> {
		let bytes = hex::decode(header_hex)
			.map_err(|e| ChainError::InvalidResponse(format!("header hex: {}", e)))?;
		let header: bitcoin::block::Header = deserialize(&bytes)?;
		let timestamp = DateTime::from_timestamp(i64::from(header.time), 0).ok_or_else(|| {
			ChainError::InvalidResponse(format!("header time {} out of range", header.time))
		})?;
		Ok(Header { height, timestamp })
	}
}

impl ClientInner {
	fn dispatch(&self, line: &str) {
		let incoming: Incoming = match serde_json::from_str(line) {
			Ok(incoming) => incoming,
			Err(e) => {
				error!("Unparseable message from Electrum server: {}", e);
				return;
			}
		};

		if let Some(id) = incoming.id {
			let Some(waiter) = self.pending.lock().remove(&id) else {
				debug!(id, "Response for unknown or expired request");
				return;
			};
			let _ = waiter.send(incoming.into_result());
			return;
		}

		match incoming.method.as_deref() {
			Some(methods::SCRIPTHASH_SUBSCRIBE) => self.dispatch_status(&incoming.params),
			Some(methods::HEADERS_SUBSCRIBE) => self.dispatch_header(&incoming.params),
			Some(other) => debug!(method = other, "Ignoring notification"),
			None => warn!("Message without id or method"),
		}
	}

	fn dispatch_status(&self, params: &[Value]) {
		let Some(script_hash) = params.first().and_then(Value::as_str) else {
			warn!("Malformed scripthash notification");
			return;
		};
		let status = params.get(1).and_then(Value::as_str).map(str::to_string);
		let callback = self.status_callbacks.lock().get(script_hash).cloned();
		match callback {
			Some(callback) => callback(script_hash.to_string(), status),
			None => debug!(script_hash, "Status change for unsubscribed script hash"),
		}
	}

	fn dispatch_header(&self, params: &[Value]) {
		let Some(notification) = params
			.first()
			.and_then(|value| serde_json::from_value::<HeaderNotification>(value.clone()).ok())
		else {
			warn!("Malformed header notification");
			return;
		};
		let header = match ElectrumClient::parse_header(notification.height, &notification.hex) {
			Ok(header) => header,
			Err(e) => {
				warn!("Invalid header notification: {}", e);
				return;
			}
		};
		let callbacks = self.header_callbacks.lock().clone();
		for callback in callbacks {
			callback(header);
		}
	}

	fn shutdown(&self) {
		self.closed.store(true, Ordering::SeqCst);
		// Dropping the senders fails every waiting request with `Closed`.
		self.pending.lock().clear();
	}
}

async fn read_loop<R>(inner: Arc<ClientInner>, reader: R)
where
	R: AsyncRead + Send + Unpin + 'static,
{
	let mut lines = BufReader::new(reader).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				if !line.trim().is_empty() {
					inner.dispatch(&line);
				}
			}
			Ok(None) => {
				info!("Electrum server closed the connection");
				break;
			}
			Err(e) => {
				error!("Electrum connection error: {}", e);
				break;
			}
		}
	}
	inner.shutdown();
}

#[async_trait]
impl ChainBackend for ElectrumClient {
	async fn script_hash_get_history(
		&self,
		script_hash: &str,
	) -> Result<Vec<TxHistoryEntry>, ChainError> {
		let result = self
			.request(methods::SCRIPTHASH_GET_HISTORY, vec![json!(script_hash)])
			.await?;
		let items: Vec<HistoryItem> = serde_json::from_value(result)?;
		items.into_iter().map(TxHistoryEntry::try_from).collect()
	}

	async fn script_hash_subscribe(
		&self,
		script_hash: &str,
		on_status_change: StatusCallback,
	) -> Result<Option<String>, ChainError> {
		self.inner
			.status_callbacks
			.lock()
			.insert(script_hash.to_string(), on_status_change);
		let result = self
			.request(methods::SCRIPTHASH_SUBSCRIBE, vec![json!(script_hash)])
			.await?;
		Ok(result.as_str().map(str::to_string))
	}

	async fn transaction_get(&self, tx_hash: Txid) -> Result<Transaction, ChainError> {
		let result = self
			.request(methods::TRANSACTION_GET, vec![json!(tx_hash.to_string())])
			.await?;
		let raw = result
			.as_str()
			.ok_or_else(|| ChainError::InvalidResponse("transaction is not a string".to_string()))?;
		let bytes = hex::decode(raw)
			.map_err(|e| ChainError::InvalidResponse(format!("transaction hex: {}", e)))?;
		Ok(deserialize(&bytes)?)
	}

	async fn headers_subscribe(&self, on_header: HeaderCallback) -> Result<Header, ChainError> {
		self.inner.header_callbacks.lock().push(on_header);
		let result = self.request(methods::HEADERS_SUBSCRIBE, vec![]).await?;
		let notification: HeaderNotification = serde_json::from_value(result)?;
		Self::parse_header(notification.height, &notification.hex)
	}

	async fn header_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ChainError> {
		let result = self.request(methods::BLOCK_HEADER, vec![json!(height)]).await?;
		let header_hex = result
			.as_str()
			.ok_or_else(|| ChainError::InvalidResponse("header is not a string".to_string()))?;
		Ok(Self::parse_header(height, header_hex)?.timestamp)
	}

	async fn transaction_broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
		let raw = hex::encode(serialize(tx));
		let result = self
			.request(methods::TRANSACTION_BROADCAST, vec![json!(raw)])
			.await?;
		let txid = result
			.as_str()
			.ok_or_else(|| ChainError::InvalidResponse("broadcast result is not a string".to_string()))?;
		txid.parse()
			.map_err(|_| ChainError::InvalidResponse(format!("bad txid {}", txid)))
	}

	async fn estimate_fee(&self, blocks: u32) -> Result<Option<u64>, ChainError> {
		let result = self.request(methods::ESTIMATE_FEE, vec![json!(blocks)]).await?;
		let btc_per_kb = result
			.as_f64()
			.ok_or_else(|| ChainError::InvalidResponse(format!("fee estimate {}", result)))?;
		// -1 means the server has not collected enough data.
		if btc_per_kb <= 0.0 {
			return Ok(None);
		}
		Ok(Some(btc_per_kb_to_sat(btc_per_kb)))
	}

	async fn relay_fee(&self) -> Result<u64, ChainError> {
		let result = self.request(methods::RELAY_FEE, vec![]).await?;
		let btc_per_kb = result
			.as_f64()
			.ok_or_else(|| ChainError::InvalidResponse(format!("relay fee {}", result)))?;
		Ok(btc_per_kb_to_sat(btc_per_kb))
	}

	async fn close(&self) {
		if let Some(handle) = self.reader.lock().take() {
			handle.abort();
		}
		self.inner.shutdown();
		let mut writer = self.inner.writer.lock().await;
		if let Err(e) = writer.shutdown().await {
			debug!("Error closing Electrum connection: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{DuplexStream, ReadHalf, WriteHalf, split};

	/// Genesis block header, timestamp 1231006505.
	const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

	struct FakeServer {
		lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
		writer: WriteHalf<DuplexStream>,
	}

	impl FakeServer {
		async fn next_request(&mut self) -> Value {
			let line = self.lines.next_line().await.unwrap().unwrap();
			serde_json::from_str(&line).unwrap()
		}

		async fn send(&mut self, message: Value) {
			let mut line = message.to_string();
			line.push('\n');
			self.writer.write_all(line.as_bytes()).await.unwrap();
		}
	}

	fn pair(timeout: Duration) -> (ElectrumClient, FakeServer) {
		let (client_io, server_io) = tokio::io::duplex(64 * 1024);
		let (client_read, client_write) = split(client_io);
		let (server_read, server_write) = split(server_io);
		let client = ElectrumClient::from_io(client_read, client_write, timeout);
		let server = FakeServer {
			lines: BufReader::new(server_read).lines(),
			writer: server_write,
		};
		(client, server)
	}

	#[tokio::test]
	async fn test_request_response_routing() {
		let (client, mut server) = pair(Duration::from_secs(5));
		let fee = tokio::spawn({
			let client = client.clone();
			async move { client.estimate_fee(2).await }
		});
		let relay = tokio::spawn({
			let client = client.clone();
			async move { client.relay_fee().await }
		});

		let first = server.next_request().await;
		let second = server.next_request().await;
		// Answer out of order.
		for request in [second, first] {
			let result = if request["method"] == methods::ESTIMATE_FEE {
				json!(0.00015)
			} else {
				json!(0.00001)
			};
			server
				.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
				.await;
		}

		assert_eq!(fee.await.unwrap().unwrap(), Some(15_000));
		assert_eq!(relay.await.unwrap().unwrap(), 1_000);
	}

	#[tokio::test]
	async fn test_missing_fee_estimate() {
		let (client, mut server) = pair(Duration::from_secs(5));
		let fee = tokio::spawn(async move { client.estimate_fee(25).await });
		let request = server.next_request().await;
		assert_eq!(request["params"], json!([25]));
		server
			.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": -1}))
			.await;
		assert_eq!(fee.await.unwrap().unwrap(), None);
	}

	#[tokio::test]
	async fn test_server_error() {
		let (client, mut server) = pair(Duration::from_secs(5));
		let get = tokio::spawn(async move {
			let txid: Txid = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
				.parse()
				.unwrap();
			client.transaction_get(txid).await
		});
		let request = server.next_request().await;
		server
			.send(json!({
				"jsonrpc": "2.0",
				"id": request["id"],
				"error": {"code": 2, "message": "daemon error"}
			}))
			.await;
		assert!(matches!(
			get.await.unwrap(),
			Err(ChainError::Rpc { code: 2, .. })
		));
	}

	#[tokio::test]
	async fn test_subscriptions() {
		let (client, mut server) = pair(Duration::from_secs(5));
		let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
		let (header_tx, mut header_rx) = tokio::sync::mpsc::unbounded_channel();

		let subscribe = tokio::spawn({
			let client = client.clone();
			async move {
				let status = client
					.script_hash_subscribe(
						"ab",
						Arc::new(move |script_hash, status| {
							let _ = status_tx.send((script_hash, status));
						}),
					)
					.await?;
				let header = client
					.headers_subscribe(Arc::new(move |header| {
						let _ = header_tx.send(header);
					}))
					.await?;
				Ok::<_, ChainError>((status, header))
			}
		});

		let request = server.next_request().await;
		server
			.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": null}))
			.await;
		let request = server.next_request().await;
		server
			.send(json!({
				"jsonrpc": "2.0",
				"id": request["id"],
				"result": {"height": 0, "hex": GENESIS_HEADER}
			}))
			.await;
		let (status, tip) = subscribe.await.unwrap().unwrap();
		assert_eq!(status, None);
		assert_eq!(tip.height, 0);
		assert_eq!(tip.timestamp.timestamp(), 1_231_006_505);

		server
			.send(json!({
				"jsonrpc": "2.0",
				"method": methods::SCRIPTHASH_SUBSCRIBE,
				"params": ["ab", "newstatus"]
			}))
			.await;
		server
			.send(json!({
				"jsonrpc": "2.0",
				"method": methods::HEADERS_SUBSCRIBE,
				"params": [{"height": 1, "hex": GENESIS_HEADER}]
			}))
			.await;
		assert_eq!(
			status_rx.recv().await.unwrap(),
			("ab".to_string(), Some("newstatus".to_string()))
		);
		assert_eq!(header_rx.recv().await.unwrap().height, 1);
	}

	#[tokio::test]
	async fn test_timeout_and_close() {
		let (client, mut server) = pair(Duration::from_millis(50));
		let result = client.relay_fee().await;
		assert!(matches!(result, Err(ChainError::Timeout)));
		server.next_request().await;

		let pending = tokio::spawn({
			let client = client.clone();
			async move {
				client
					.request(methods::RELAY_FEE, vec![])
					.await
			}
		});
		server.next_request().await;
		drop(server);
		assert!(matches!(
			pending.await.unwrap(),
			Err(ChainError::Closed | ChainError::Timeout)
		));
		client.close().await;
		assert!(matches!(client.relay_fee().await, Err(ChainError::Closed)));
	}
}
