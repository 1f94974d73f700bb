use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Sender};
use tracing::debug;

use crate::error::{CairnError, Result};
use crate::storage::protocol::{
    read_frame, write_frame, Reply, ReplyEnvelope, Request, RequestEnvelope, PROTOCOL_VERSION,
};
use crate::storage::StorageBackend;

/// Network storage backend: one persistent TCP connection, requests tagged
/// with a client-assigned id, replies routed through a request-id-keyed map
/// by a dedicated reader thread. The write side is serialized internally,
/// so callers may issue requests from many threads.
pub struct NetBackend {
    writer: Mutex<TcpStream>,
    pending: Arc<Mutex<HashMap<u64, Sender<Reply>>>>,
    next_id: AtomicU64,
}

impl NetBackend {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;

        let pending: Arc<Mutex<HashMap<u64, Sender<Reply>>>> = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = Arc::clone(&pending);
        std::thread::spawn(move || {
            let mut stream = reader_stream;
            loop {
                let envelope: ReplyEnvelope = match read_frame(&mut stream) {
                    Ok(env) => env,
                    Err(e) => {
                        // Connection gone: fail every in-flight request so
                        // callers unblock instead of hanging.
                        debug!("net backend reader exiting: {e}");
                        let mut map = reader_pending.lock().unwrap();
                        for (_, tx) in map.drain() {
                            let _ = tx.send(Reply::Error(format!("connection lost: {e}")));
                        }
                        return;
                    }
                };
                let tx = reader_pending.lock().unwrap().remove(&envelope.id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(envelope.body);
                    }
                    None => debug!("net backend: reply for unknown request id {}", envelope.id),
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    fn request(&self, body: Request) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.lock().unwrap().insert(id, tx);

        let envelope = RequestEnvelope {
            id,
            version: PROTOCOL_VERSION,
            body,
        };
        {
            let mut writer = self.writer.lock().unwrap();
            if let Err(e) = write_frame(&mut *writer, &envelope) {
                self.pending.lock().unwrap().remove(&id);
                return Err(e);
            }
        }

        match rx.recv() {
            Ok(Reply::Error(message)) => Err(CairnError::Other(format!("remote: {message}"))),
            Ok(reply) => Ok(reply),
            Err(_) => Err(CairnError::Other("net backend reply channel closed".into())),
        }
    }

    fn unexpected(op: &str, reply: Reply) -> CairnError {
        CairnError::InvalidFormat(format!("net backend {op}: unexpected reply {reply:?}"))
    }
}

impl StorageBackend for NetBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.request(Request::Get { key: key.into() })? {
            Reply::Data(data) => Ok(data),
            other => Err(Self::unexpected("GET", other)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        match self.request(Request::Put {
            key: key.into(),
            data: data.to_vec(),
        })? {
            Reply::Unit => Ok(()),
            other => Err(Self::unexpected("PUT", other)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.request(Request::Delete { key: key.into() })? {
            Reply::Unit => Ok(()),
            other => Err(Self::unexpected("DELETE", other)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.request(Request::Exists { key: key.into() })? {
            Reply::Bool(found) => Ok(found),
            other => Err(Self::unexpected("EXISTS", other)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self.request(Request::List {
            prefix: prefix.into(),
        })? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(Self::unexpected("LIST", other)),
        }
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        match self.request(Request::GetRange {
            key: key.into(),
            offset,
            length,
        })? {
            Reply::Data(data) => Ok(data),
            other => Err(Self::unexpected("GET_RANGE", other)),
        }
    }
}
