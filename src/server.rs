//! TCP listener for control connections.
use std::{
    collections::HashMap,
    io::{self, BufReader},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    error::CorralError,
    ipc,
    message::Message,
    registry::{Connection, ConnectionId},
    router::MessageRouter,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on one outbound write; a peer that stops reading fails the send.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of an accepted TCP stream.
pub struct TcpConnection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<TcpStream>,
}

impl TcpConnection {
    fn new(id: ConnectionId, peer: SocketAddr, stream: &TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            id,
            peer: peer.to_string(),
            writer: Mutex::new(writer),
        })
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), CorralError> {
        let mut stream = self.writer.lock()?;
        ipc::write_message(&mut *stream, message)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

type OpenStreams = Arc<Mutex<HashMap<ConnectionId, TcpStream>>>;

/// Accepts control connections and feeds every line into the router.
///
/// One thread accepts; each connection gets a reader thread that dispatches
/// messages in arrival order and reports the close to the router.
pub struct ControlServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    streams: OpenStreams,
}

impl ControlServer {
    pub fn bind(addr: impl Into<SocketAddr>, router: Arc<MessageRouter>) -> Result<Self, CorralError> {
        let listener = TcpListener::bind(addr.into())?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let streams: OpenStreams = Arc::new(Mutex::new(HashMap::new()));

        let accept_running = Arc::clone(&running);
        let accept_streams = Arc::clone(&streams);
        let accept_handle = thread::spawn(move || {
            accept_loop(listener, router, accept_running, accept_streams);
        });

        info!("Control listener bound to {addr}");
        Ok(Self {
            addr,
            running,
            accept_handle: Some(accept_handle),
            streams,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and closes every open connection. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.accept_handle.take()
            && handle.join().is_err()
        {
            error!("Control accept thread panicked");
        }

        let streams: Vec<TcpStream> = match self.streams.lock() {
            Ok(mut streams) => streams.drain().map(|(_, stream)| stream).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .drain()
                .map(|(_, stream)| stream)
                .collect(),
        };
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("Control listener on {} closed", self.addr);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    router: Arc<MessageRouter>,
    running: Arc<AtomicBool>,
    streams: OpenStreams,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = open_connection(stream, peer, &router, &streams) {
                    warn!("Failed to set up control connection from {peer}: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("Control listener error: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Control accept loop exited");
}

fn open_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: &Arc<MessageRouter>,
    streams: &OpenStreams,
) -> Result<(), CorralError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let id = ConnectionId::next();
    let reader = stream.try_clone()?;
    let connection: Arc<dyn Connection> = Arc::new(TcpConnection::new(id, peer, &stream)?);
    streams.lock()?.insert(id, stream);
    debug!("Accepted control connection {id} from {peer}");

    let router = Arc::clone(router);
    let streams = Arc::clone(streams);
    thread::spawn(move || {
        read_loop(reader, &connection, &router);
        router.connection_closed(id);
        if let Ok(mut streams) = streams.lock() {
            streams.remove(&id);
        }
        debug!("Control connection {id} from {peer} finished");
    });
    Ok(())
}

fn read_loop(stream: TcpStream, connection: &Arc<dyn Connection>, router: &MessageRouter) {
    let mut reader = BufReader::new(stream);
    loop {
        match ipc::read_message(&mut reader) {
            Ok(Some(message)) => {
                router.dispatch(connection, &message);
            }
            Ok(None) => break,
            Err(err) if ipc::is_disconnect(&err) => break,
            Err(err) if ipc::is_malformed(&err) => {
                warn!(
                    "Ignoring malformed message on {}: {err}",
                    connection.peer()
                );
            }
            Err(err) => {
                warn!("Control connection {} failed: {err}", connection.peer());
                break;
            }
        }
    }
}
