//! The byte channel under a connection and the readiness source that tells
//! the handshake poller which channels to read.
use std::{
    collections::BTreeSet,
    fmt::Display,
    io::{self, ErrorKind},
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
};

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::error::Error;

/// Identifies a registration with a [`Selector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A non-blocking, bidirectional byte channel.
pub trait Transport: Send + 'static {
    /// Read whatever is available, `WouldBlock` means nothing is and `Ok(0)`
    /// that the remote closed the channel.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer or fail.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn close(self);
}

/// Readiness registration for transports of type `T`.
pub trait Selector<T>: Send + 'static {
    fn register(&mut self, token: Token, io: &T) -> io::Result<()>;

    /// Ask to be told again once `io` has new bytes, after a read of it
    /// ended in `WouldBlock`.
    fn reregister(&mut self, _token: Token, _io: &T) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, token: Token);

    /// Tokens that may have data to read, without waiting.
    fn select_now(&mut self) -> Vec<Token>;
}

/// A transport whose read readiness is tracked by the tokio reactor.
pub trait ReadReady {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl ReadReady for TcpStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }
}

type ReadySet = Arc<Mutex<BTreeSet<Token>>>;

/// Wakes by marking its token ready.
struct TokenWaker {
    token: Token,
    ready: ReadySet,
}

impl Wake for TokenWaker {
    fn wake(self: Arc<Self>) {
        self.ready.lock().insert(self.token);
    }
}

/// A [`Selector`] fed by the tokio reactor: a token is reported once its
/// transport became readable, and then not again until it is re-registered
/// and readable once more.
#[derive(Debug, Default)]
pub struct ReactorSelector {
    registered: BTreeSet<Token>,
    ready: ReadySet,
}

impl ReactorSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Leave a waker with the reactor, or mark the token ready right away
    /// if there are bytes already.
    fn arm<T: ReadReady>(&mut self, token: Token, io: &T) -> io::Result<()> {
        let waker = Waker::from(Arc::new(TokenWaker {
            token,
            ready: self.ready.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        match io.poll_read_ready(&mut cx) {
            Poll::Ready(Ok(())) => {
                self.ready.lock().insert(token);
                Ok(())
            }
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(()),
        }
    }
}

impl<T: ReadReady> Selector<T> for ReactorSelector {
    fn register(&mut self, token: Token, io: &T) -> io::Result<()> {
        self.arm(token, io)?;
        self.registered.insert(token);
        Ok(())
    }

    fn reregister(&mut self, token: Token, io: &T) -> io::Result<()> {
        self.arm(token, io)
    }

    fn deregister(&mut self, token: Token) {
        self.registered.remove(&token);
        self.ready.lock().remove(&token);
    }

    fn select_now(&mut self) -> Vec<Token> {
        // wakers of deregistered tokens may still fire
        let ready = std::mem::take(&mut *self.ready.lock());
        ready.into_iter().filter(|t| self.registered.contains(t)).collect()
    }
}

impl Transport for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let written = TcpStream::try_write(self, buf)?;

        // the send buffer of a new connection fits a handshake, anything
        // less is given up on instead of waiting for writability.
        if written < buf.len() {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                Error::PartialWrite { written, len: buf.len() },
            ));
        }
        Ok(())
    }

    /// Dropping the stream closes the socket.
    fn close(self) {
        drop(self);
    }
}
