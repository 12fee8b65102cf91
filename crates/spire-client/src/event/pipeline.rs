//! Pipelined connections.
//!
//! With pipelining on, each event loop keeps one connection per node and
//! writes requests on it back to back without waiting for answers. The
//! server answers in order, so each response belongs to the oldest
//! request still waiting. Any error on the connection fails every request
//! in flight and closes it: once one answer is lost the rest can no longer
//! be matched.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use spire_protocol::ProtoHeader;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use super::io::{AsyncConn, Interest};
use super::state::{Frame, Outgoing, Progress};
use crate::command::MAX_RESPONSE_SIZE;
use crate::error::ClientError;

/// A raw response, parsed by the command that owns it.
pub(crate) type Reply = Result<(ProtoHeader, BytesMut), ClientError>;

struct Submission {
    request: Bytes,
    sent: Rc<Cell<bool>>,
    reply: oneshot::Sender<Reply>,
}

/// What the submitting command holds while its request is in the pipeline.
pub(crate) struct Ticket {
    /// Set once the request was fully written.
    pub sent: Rc<Cell<bool>>,
    pub reply: oneshot::Receiver<Reply>,
}

struct Pending {
    sent: Rc<Cell<bool>>,
    reply: oneshot::Sender<Reply>,
}

/// Requests on the wire, oldest first.
#[derive(Default)]
pub(crate) struct PipelineQueue {
    in_flight: VecDeque<Pending>,
}

impl PipelineQueue {
    fn push(&mut self, sent: Rc<Cell<bool>>, reply: oneshot::Sender<Reply>) {
        self.in_flight.push_back(Pending { sent, reply });
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Hands a response to the oldest waiting request.
    fn complete_oldest(&mut self, reply: Reply) {
        if let Some(pending) = self.in_flight.pop_front() {
            // the caller may have timed out and gone away
            let _ = pending.reply.send(reply);
        }
    }

    fn fail_all(&mut self, cause: &ClientError) {
        for pending in self.in_flight.drain(..) {
            let _ = pending.reply.send(Err(ClientError::connection(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("pipeline closed: {cause}"),
            ))));
        }
    }
}

/// One event loop's pipelined connection to one node.
pub(crate) struct Pipeline {
    tx: mpsc::UnboundedSender<Submission>,
    abort: Rc<Notify>,
}

impl Pipeline {
    /// Spawns the connection task on the current `LocalSet`. `connect`
    /// yields a connection that is fully set up (TLS, authentication).
    pub fn start<F>(connect: F) -> Self
    where
        F: Future<Output = Result<AsyncConn, ClientError>> + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = Rc::new(Notify::new());
        tokio::task::spawn_local(run(connect, rx, Rc::clone(&abort)));
        Self { tx, abort }
    }

    /// The connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn submit(&self, request: Bytes) -> Result<Ticket, ClientError> {
        let (reply, rx) = oneshot::channel();
        let sent = Rc::new(Cell::new(false));
        self.tx
            .send(Submission {
                request,
                sent: Rc::clone(&sent),
                reply,
            })
            .map_err(|_| {
                ClientError::connection(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "pipeline closed",
                ))
            })?;
        Ok(Ticket { sent, reply: rx })
    }

    /// Closes the connection and fails everything in flight.
    pub fn abort(&self) {
        self.abort.notify_one();
    }
}

async fn run<F>(connect: F, mut rx: mpsc::UnboundedReceiver<Submission>, abort: Rc<Notify>)
where
    F: Future<Output = Result<AsyncConn, ClientError>>,
{
    let mut queue = PipelineQueue::default();
    let connected = tokio::select! {
        biased;
        _ = abort.notified() => Err(ClientError::Aborted),
        conn = connect => conn,
    };
    let cause = match connected {
        Ok(mut conn) => {
            let cause = serve(&mut conn, &mut rx, &mut queue, &abort).await;
            debug!(node = conn.node().name(), in_flight = queue.len(), "pipeline closed");
            cause
        }
        Err(e) => Some(e),
    };

    rx.close();
    while let Ok(sub) = rx.try_recv() {
        queue.push(sub.sent, sub.reply);
    }
    if let Some(cause) = cause {
        queue.fail_all(&cause);
    }
}

/// Moves requests out and responses in until the connection fails or
/// the pipeline is dropped with nothing in flight.
async fn serve(
    conn: &mut AsyncConn,
    rx: &mut mpsc::UnboundedReceiver<Submission>,
    queue: &mut PipelineQueue,
    abort: &Notify,
) -> Option<ClientError> {
    let mut backlog: VecDeque<Submission> = VecDeque::new();
    let mut writing: Option<(Outgoing, Rc<Cell<bool>>)> = None;
    let mut frame = Frame::new(MAX_RESPONSE_SIZE);
    let mut header: Option<ProtoHeader> = None;
    let mut open = true;

    loop {
        let mut want_read = false;
        let mut want_write = false;

        loop {
            if writing.is_none() {
                let Some(sub) = backlog.pop_front() else {
                    break;
                };
                queue.push(Rc::clone(&sub.sent), sub.reply);
                writing = Some((Outgoing::new(sub.request), sub.sent));
            }
            let Some((out, sent)) = writing.as_mut() else {
                break;
            };
            match out.poll(conn) {
                Ok(Progress::Ready(())) => {
                    sent.set(true);
                    writing = None;
                }
                Ok(Progress::Wait(Interest::Write)) => {
                    want_write = true;
                    break;
                }
                Ok(Progress::Wait(Interest::Read)) => {
                    want_read = true;
                    break;
                }
                Err(e) => return Some(e),
            }
        }

        while !queue.is_empty() {
            let step = match header.take() {
                None => match frame.read_header(conn) {
                    Ok(Progress::Ready(h)) => {
                        header = Some(h);
                        continue;
                    }
                    Ok(Progress::Wait(interest)) => interest,
                    Err(e) => return Some(e),
                },
                Some(h) => match frame.read_body(conn) {
                    Ok(Progress::Ready(body)) => {
                        queue.complete_oldest(Ok((h, body)));
                        continue;
                    }
                    Ok(Progress::Wait(interest)) => {
                        header = Some(h);
                        interest
                    }
                    Err(e) => return Some(e),
                },
            };
            match step {
                Interest::Read => want_read = true,
                Interest::Write => want_write = true,
            }
            break;
        }

        if !open && backlog.is_empty() && writing.is_none() && queue.is_empty() {
            return None;
        }

        tokio::select! {
            biased;
            _ = abort.notified() => return Some(ClientError::Aborted),
            sub = rx.recv(), if open => match sub {
                Some(sub) => backlog.push_back(sub),
                None => open = false,
            },
            ready = conn.wait_any(want_read, want_write), if want_read || want_write => {
                if let Err(e) = ready {
                    return Some(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spire_protocol::{ResultCode, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::command::tests::{key, response};
    use crate::command::{handle_response, Operation, SingleCommand};
    use crate::event::io::AsyncSlot;
    use crate::executor::tests::node;

    async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 8];
        sock.read_exact(&mut header).await.unwrap();
        let size = ProtoHeader::decode(&header).unwrap().size as usize;
        let mut body = vec![0u8; size];
        sock.read_exact(&mut body).await.unwrap();
        body
    }

    fn start(addr: std::net::SocketAddr, slot: AsyncSlot) -> Pipeline {
        Pipeline::start(async move {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(ClientError::connection)?;
            AsyncConn::from_stream(tcp, None, slot)
        })
    }

    fn request(tag: i64) -> Bytes {
        response(ResultCode::Ok, &[("tag", Value::Int(tag))]).freeze()
    }

    #[tokio::test]
    async fn responses_go_to_the_oldest_request() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                tokio::spawn(async move {
                    let (mut sock, _) = listener.accept().await.unwrap();
                    // read all three before answering any
                    for _ in 0..3 {
                        read_request(&mut sock).await;
                    }
                    for i in 0..3 {
                        let reply = response(ResultCode::Ok, &[("i", Value::Int(i))]);
                        sock.write_all(&reply).await.unwrap();
                    }
                    let mut rest = Vec::new();
                    let _ = sock.read_to_end(&mut rest).await;
                });

                let a = node(0, "A", 1);
                let pipe = start(addr, AsyncSlot::claim(&a, 0, 4).unwrap());
                let tickets: Vec<Ticket> =
                    (0..3).map(|i| pipe.submit(request(i)).unwrap()).collect();

                for (i, ticket) in tickets.into_iter().enumerate() {
                    let (header, body) = ticket.reply.await.unwrap().unwrap();
                    assert!(ticket.sent.get());
                    let mut cmd = SingleCommand::new(key(), 4096, Operation::Get { bins: vec![] });
                    handle_response(&mut cmd, header, &body).unwrap();
                    let record = cmd.into_record().unwrap();
                    assert_eq!(record.get("i"), Some(&Value::Int(i as i64)));
                }
                assert_eq!(a.async_open(0), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn abort_fails_everything_in_flight_and_closes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                tokio::spawn(async move {
                    let (mut sock, _) = listener.accept().await.unwrap();
                    let mut sink = Vec::new();
                    let _ = sock.read_to_end(&mut sink).await;
                });

                let a = node(0, "A", 1);
                let pipe = start(addr, AsyncSlot::claim(&a, 0, 4).unwrap());
                let first = pipe.submit(request(1)).unwrap();
                let second = pipe.submit(request(2)).unwrap();
                tokio::task::yield_now().await;
                pipe.abort();

                for ticket in [first, second] {
                    let err = ticket.reply.await.unwrap().unwrap_err();
                    assert!(matches!(err, ClientError::Connection { .. }));
                }
                while !pipe.is_closed() {
                    tokio::task::yield_now().await;
                }
                assert_eq!(a.async_open(0), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn failed_connect_fails_queued_requests() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                drop(listener);

                let a = node(0, "A", 1);
                let pipe = start(addr, AsyncSlot::claim(&a, 0, 4).unwrap());
                let ticket = pipe.submit(request(1)).unwrap();
                assert!(ticket.reply.await.unwrap().is_err());
                assert!(!ticket.sent.get());
            })
            .await;
    }
}
