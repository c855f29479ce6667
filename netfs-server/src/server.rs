use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, error, info, warn};
use netfs::io::BlockStorage;
use netfs::{FileServer, BLOCK_SIZE};

use crate::error::ServerError;
use crate::protocol::{Header, MAX_MESSAGE_SIZE};

/// Accepts connections forever and serves each one on its own thread.
pub struct Server<T: BlockStorage + 'static> {
    listener: TcpListener,
    fs: Arc<FileServer<T>>,
    gate: Option<Arc<ConnectionGate>>,
}

impl<T: BlockStorage + 'static> Server<T> {
    pub fn bind<A: ToSocketAddrs>(addr: A, fs: FileServer<T>) -> io::Result<Self> {
        Ok(Server {
            listener: TcpListener::bind(addr)?,
            fs: Arc::new(fs),
            gate: None,
        })
    }

    /// Caps the number of connections served at once. `None` leaves it unbounded.
    pub fn with_max_connections(mut self, limit: Option<usize>) -> Self {
        self.gate = limit.map(ConnectionGate::new);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop. Only returns if the listener itself breaks.
    pub fn run(self) -> io::Result<()> {
        info!("listening on {}", self.local_addr()?);
        loop {
            // Waits here while the server is at its connection limit.
            let permit = self.gate.as_ref().map(ConnectionGate::enter);

            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            debug!("connection from {}", peer);

            let fs = Arc::clone(&self.fs);
            let spawned = thread::Builder::new()
                .name(format!("conn-{}", peer))
                .spawn(move || {
                    let _permit = permit;
                    serve_connection(&fs, stream, peer);
                });
            if let Err(err) = spawned {
                error!("could not start a thread for {}: {}", peer, err);
            }
        }
    }
}

/// Serves the single request on `stream`, then closes it. Failures are only logged; the
/// client sees the connection close without a response.
fn serve_connection<T: BlockStorage>(fs: &FileServer<T>, stream: TcpStream, peer: SocketAddr) {
    match handle_request(fs, &stream, peer) {
        Ok(()) => debug!("{} served", peer),
        Err(err) => warn!("{}: {}", peer, err),
    }
}

fn handle_request<T: BlockStorage>(
    fs: &FileServer<T>,
    stream: &TcpStream,
    peer: SocketAddr,
) -> Result<(), ServerError> {
    let mut reader = BufReader::new(stream);
    let header = Header::parse(&read_header(&mut reader)?)?;
    info!("{}: {}", peer, header);

    let data = if header.expects_data() {
        let mut block = Box::new([0; BLOCK_SIZE]);
        reader.read_exact(&mut block[..])?;
        Some(block)
    } else {
        None
    };

    let request = header.clone().into_request(data)?;
    let outcome = fs.execute(&header.user, &request)?;

    let mut writer = stream;
    writer.write_all(&header.response(&outcome))?;
    Ok(())
}

/// Reads up to and including the NUL that ends a header, returning the bytes before it.
fn read_header<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ServerError> {
    let mut raw = Vec::with_capacity(MAX_MESSAGE_SIZE + 1);
    reader
        .by_ref()
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(0, &mut raw)?;

    match raw.pop() {
        Some(0) => Ok(raw),
        _ => Err(ServerError::Malformed(format!(
            "header missing its terminator within {} bytes",
            MAX_MESSAGE_SIZE
        ))),
    }
}

/// Counting gate bounding how many connections are served at once.
pub struct ConnectionGate {
    limit: usize,
    active: Mutex<usize>,
    freed: Condvar,
}

/// One admitted connection. Dropping it lets the next one in.
pub struct Permit {
    gate: Arc<ConnectionGate>,
}

impl ConnectionGate {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(ConnectionGate {
            limit: limit.max(1),
            active: Mutex::new(0),
            freed: Condvar::new(),
        })
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until fewer than `limit` permits are out.
    pub fn enter(gate: &Arc<Self>) -> Permit {
        let mut active = gate.count();
        while *active >= gate.limit {
            active = gate
                .freed
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *active += 1;
        Permit {
            gate: Arc::clone(gate),
        }
    }

    pub fn active(&self) -> usize {
        *self.count()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        *self.gate.count() -= 1;
        self.gate.freed.notify_one();
    }
}
