//! TCP flow streams
//!
//! The receive side of a TCP flow only reads; each read is stamped right
//! after it returns. A zero-byte read means the peer closed its side.

use crate::udp::{is_timeout, RecvOutcome};
use crate::{Error, Result, Timestamp};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub struct TcpFlowStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpFlowStream {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        Ok(Self { stream, peer })
    }

    /// Connect to `target`, giving up after `timeout`
    pub fn connect(target: &SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(target, timeout)
            .map_err(|e| Error::Connection(format!("Connection to {target} failed: {e}")))?;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    /// Set the receive timeout, `None` blocks indefinitely
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        loop {
            return match self.stream.read(buf) {
                Ok(0) => Ok(RecvOutcome::Closed),
                Ok(len) => {
                    Ok(RecvOutcome::Data { len, timestamp: Timestamp::now(), kernel: false })
                }
                Err(e) if is_timeout(&e) => {
                    Ok(RecvOutcome::WouldBlock { timestamp: Timestamp::now() })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_recv_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let sender = thread::spawn(move || {
            let mut client = TcpFlowStream::connect(&addr, Duration::from_secs(1)).unwrap();
            client.send_all(&[7u8; 1000]).unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        let mut flow = TcpFlowStream::new(stream).unwrap();
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match flow.recv(&mut buf).unwrap() {
                RecvOutcome::Data { len, .. } => total += len,
                RecvOutcome::Closed => break,
                RecvOutcome::WouldBlock { .. } => panic!("no timeout configured"),
            }
        }
        sender.join().unwrap();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_tcp_recv_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut flow = TcpFlowStream::new(stream).unwrap();
        flow.set_recv_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(flow.recv(&mut buf).unwrap(), RecvOutcome::WouldBlock { .. }));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpFlowStream::connect(&addr, Duration::from_millis(200));
        assert!(matches!(err, Err(Error::Connection(_))));
    }
}
