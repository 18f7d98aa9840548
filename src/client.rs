//! Worker-side end of a control connection.
use std::{
    env,
    io::BufReader,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::CorralError,
    ipc,
    message::Message,
    process::{ENV_HOST, ENV_PORT, ENV_SERVICE_NAME},
};

/// Connects a process to the supervisor under a node name.
///
/// The handshake is sent on connect. Inbound messages are collected by a
/// reader thread and handed out through [`NodeClient::recv_timeout`].
pub struct NodeClient {
    name: String,
    writer: Mutex<TcpStream>,
    inbox: Mutex<mpsc::Receiver<Message>>,
    connected: Arc<AtomicBool>,
    next_mid: AtomicU64,
}

impl NodeClient {
    pub fn connect(addr: impl ToSocketAddrs, name: impl Into<String>) -> Result<Self, CorralError> {
        let name = name.into();
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = Arc::clone(&connected);
        let reader_name = name.clone();
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            loop {
                match ipc::read_message(&mut reader) {
                    Ok(Some(message)) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) if ipc::is_malformed(&err) => {
                        warn!("Node '{reader_name}' ignored malformed message: {err}");
                    }
                    Err(err) => {
                        if !ipc::is_disconnect(&err) {
                            warn!("Node '{reader_name}' connection failed: {err}");
                        }
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            debug!("Node '{reader_name}' reader finished");
        });

        let client = Self {
            name,
            writer: Mutex::new(stream),
            inbox: Mutex::new(rx),
            connected,
            next_mid: AtomicU64::new(1),
        };
        client.send(Message::handshake(client.name.clone()))?;
        Ok(client)
    }

    /// Connects using the variables the supervisor sets for its children.
    pub fn from_env() -> Result<Self, CorralError> {
        let host = env::var(ENV_HOST).map_err(|_| CorralError::MissingEnvVar(ENV_HOST.into()))?;
        let port: u16 = env::var(ENV_PORT)
            .map_err(|_| CorralError::MissingEnvVar(ENV_PORT.into()))?
            .parse()
            .map_err(|_| CorralError::Protocol(format!("{ENV_PORT} is not a valid port")))?;
        let name = env::var(ENV_SERVICE_NAME)
            .map_err(|_| CorralError::MissingEnvVar(ENV_SERVICE_NAME.into()))?;
        Self::connect((host.as_str(), port), name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `message`, filling in `from` and `mid` when they are empty.
    ///
    /// Returns the message id that was used.
    pub fn send(&self, mut message: Message) -> Result<String, CorralError> {
        if message.from.is_empty() {
            message.from = self.name.clone();
        }
        if message.mid.is_empty() {
            let n = self.next_mid.fetch_add(1, Ordering::Relaxed);
            message.mid = format!("{}-{n}", self.name);
        }
        let mut stream = self.writer.lock()?;
        ipc::write_message(&mut *stream, &message)?;
        Ok(message.mid)
    }

    pub fn send_to(&self, to: &str, topic: &str, data: Value) -> Result<String, CorralError> {
        self.send(Message::new(topic, to, self.name.clone()).with_data(data))
    }

    /// Waits up to `timeout` for the next inbound message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inbox.lock().ok()?.recv_timeout(timeout).ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, CorralError> {
        Ok(self.writer.lock()?.peer_addr()?)
    }

    pub fn close(&self) {
        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.close();
    }
}
