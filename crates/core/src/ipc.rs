//! Single-instance IPC: a TCP listener on a fixed loopback port accepts
//! a JSON payload `{"files":[<abs-path>,...]}`. If the port is already
//! bound on startup, the new process forwards its payload to the
//! existing holder and the caller should exit(0).
//!
//! Modeled as a guard whose `Drop` releases the listener.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

/// Fixed loopback port the `local` CLI subcommand binds for
/// single-instance coordination. Distinct from the master's HTTP
/// control-plane port (5580) so a `local` run and a `master` run on the
/// same host never contend for the same port.
pub const DEFAULT_PORT: u16 = 45_871;

/// Payload exchanged between a freshly-launched process and the one
/// already holding the IPC port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcPayload {
    pub files: Vec<String>,
}

/// Outcome of attempting to acquire the single-instance IPC port.
pub enum Acquire {
    /// This process is the sole instance; `Guard` releases the port on
    /// drop. Use `Guard::listener` to accept connections.
    Acquired(Guard),
    /// Another instance already holds the port; the payload has been
    /// forwarded to it.
    Forwarded,
}

/// Holds the bound IPC listener for as long as this process should
/// remain the single instance.
pub struct Guard {
    listener: TcpListener,
}

impl Guard {
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }
}

/// Attempt to become the single instance on `port`. On failure to
/// bind, connect to the existing holder and forward `payload`.
pub fn acquire(port: u16, payload: &IpcPayload) -> std::io::Result<Acquire> {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => Ok(Acquire::Acquired(Guard { listener })),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            forward(port, payload)?;
            Ok(Acquire::Forwarded)
        }
        Err(err) => Err(err),
    }
}

fn forward(port: u16, payload: &IpcPayload) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    let body = serde_json::to_vec(payload)?;
    stream.write_all(&body)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

/// Read one forwarded `IpcPayload` from an accepted connection.
pub fn read_payload(mut stream: TcpStream) -> std::io::Result<IpcPayload> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn first_process_acquires_second_forwards() {
        let port = free_port();
        let payload = IpcPayload {
            files: vec!["/tmp/a.moho".to_string()],
        };

        let guard = match acquire(port, &payload).unwrap() {
            Acquire::Acquired(guard) => guard,
            Acquire::Forwarded => panic!("first acquire should succeed"),
        };

        let handle = thread::spawn(move || {
            let (stream, _) = guard.listener().accept().unwrap();
            read_payload(stream).unwrap()
        });

        let second = acquire(port, &payload).unwrap();
        assert!(matches!(second, Acquire::Forwarded));

        let received = handle.join().unwrap();
        assert_eq!(received.files, payload.files);
    }
}
