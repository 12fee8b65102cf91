//! The async command state machine.
//!
//! ```text
//! Connecting -> [TlsHandshake] -> [AuthWrite -> AuthReadHeader -> AuthReadBody]
//!            -> CommandWrite -> ReadHeader -> ReadBody -> (ReadHeader ...) -> Done
//! ```
//!
//! `resume` runs the machine until it finishes or an operation would
//! block, and then reports which readiness event to wait for. Calling it
//! again re-enters the same state, so a read that returned nothing never
//! causes the request to be written twice.

use std::io;

use bytes::{Bytes, BytesMut};
use spire_protocol::{admin, ProtoHeader, ResultCode, PROTO_HEADER_SIZE};

use super::io::{CommandIo, Interest, IoStatus};
use crate::command::{handle_response, Command, Flow, MAX_RESPONSE_SIZE};
use crate::error::ClientError;

/// Admin responses are a header and nothing else of note.
const MAX_AUTH_RESPONSE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    TlsHandshake,
    AuthWrite,
    AuthReadHeader,
    AuthReadBody,
    CommandWrite,
    ReadHeader,
    ReadBody,
    Done,
}

/// Result of driving a machine or one of its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress<T> {
    Ready(T),
    Wait(Interest),
}

fn closed_by_peer() -> ClientError {
    ClientError::connection(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    ))
}

/// A buffer being written out, resumable across partial writes.
#[derive(Debug, Default)]
pub(crate) struct Outgoing {
    data: Bytes,
    pos: usize,
}

impl Outgoing {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes what remains, then flushes.
    pub fn poll<I: CommandIo>(&mut self, io: &mut I) -> Result<Progress<()>, ClientError> {
        while self.pos < self.data.len() {
            match io.write(&self.data[self.pos..])? {
                IoStatus::Ready(0) => {
                    return Err(ClientError::connection(io::ErrorKind::WriteZero.into()))
                }
                IoStatus::Ready(n) => self.pos += n,
                IoStatus::WantRead => return Ok(Progress::Wait(Interest::Read)),
                IoStatus::WantWrite => return Ok(Progress::Wait(Interest::Write)),
            }
        }
        match io.flush()? {
            IoStatus::Ready(_) => Ok(Progress::Ready(())),
            IoStatus::WantRead => Ok(Progress::Wait(Interest::Read)),
            IoStatus::WantWrite => Ok(Progress::Wait(Interest::Write)),
        }
    }
}

/// Reads one proto message in two steps, header then body.
#[derive(Debug)]
pub(crate) struct Frame {
    buf: BytesMut,
    pos: usize,
    limit: u64,
}

impl Frame {
    pub fn new(limit: u64) -> Self {
        Self {
            buf: BytesMut::zeroed(PROTO_HEADER_SIZE),
            pos: 0,
            limit,
        }
    }

    pub fn read_header<I: CommandIo>(
        &mut self,
        io: &mut I,
    ) -> Result<Progress<ProtoHeader>, ClientError> {
        if let Some(interest) = self.fill(io)? {
            return Ok(Progress::Wait(interest));
        }
        let header = ProtoHeader::decode(&self.buf)?;
        let size = header.check_size(self.limit)?;
        self.expect(size);
        Ok(Progress::Ready(header))
    }

    pub fn read_body<I: CommandIo>(&mut self, io: &mut I) -> Result<Progress<BytesMut>, ClientError> {
        if let Some(interest) = self.fill(io)? {
            return Ok(Progress::Wait(interest));
        }
        let body = std::mem::replace(&mut self.buf, BytesMut::zeroed(PROTO_HEADER_SIZE));
        self.pos = 0;
        Ok(Progress::Ready(body))
    }

    fn expect(&mut self, size: usize) {
        self.buf.clear();
        self.buf.resize(size, 0);
        self.pos = 0;
    }

    fn fill<I: CommandIo>(&mut self, io: &mut I) -> Result<Option<Interest>, ClientError> {
        while self.pos < self.buf.len() {
            match io.read(&mut self.buf[self.pos..])? {
                IoStatus::Ready(0) => return Err(closed_by_peer()),
                IoStatus::Ready(n) => self.pos += n,
                // decrypted bytes arrived without a new readiness event
                IoStatus::WantRead if io.pending() => continue,
                IoStatus::WantRead => return Ok(Some(Interest::Read)),
                IoStatus::WantWrite => return Ok(Some(Interest::Write)),
            }
        }
        Ok(None)
    }
}

/// One attempt of one command on one connection.
#[derive(Debug)]
pub(crate) struct Machine {
    state: State,
    tls: bool,
    auth: Outgoing,
    request: Outgoing,
    frame: Frame,
    header: Option<ProtoHeader>,
    header_parsed: bool,
    sent: bool,
}

impl Machine {
    /// A machine for a connection that is still being established. An
    /// empty request sets the connection up and stops after
    /// authentication.
    pub fn connecting(request: Bytes, tls: bool, auth: Option<Bytes>) -> Self {
        Self::new(State::Connecting, request, tls, auth)
    }

    /// A machine for a pooled connection, ready for the request.
    pub fn pooled(request: Bytes) -> Self {
        Self::new(State::CommandWrite, request, false, None)
    }

    fn new(state: State, request: Bytes, tls: bool, auth: Option<Bytes>) -> Self {
        Self {
            state,
            tls,
            auth: Outgoing::new(auth.unwrap_or_default()),
            request: Outgoing::new(request),
            frame: Frame::new(MAX_RESPONSE_SIZE),
            header: None,
            header_parsed: false,
            sent: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The request was fully written at least once.
    pub fn sent(&self) -> bool {
        self.sent
    }

    /// A response header was parsed during this attempt.
    pub fn header_parsed(&self) -> bool {
        self.header_parsed
    }

    /// Drives the command until it completes or must wait.
    pub fn resume<I: CommandIo>(
        &mut self,
        io: &mut I,
        cmd: &mut dyn Command,
    ) -> Result<Progress<()>, ClientError> {
        loop {
            match self.state {
                State::CommandWrite => match self.request.poll(io)? {
                    Progress::Ready(()) => {
                        self.sent = true;
                        self.state = State::ReadHeader;
                    }
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::ReadHeader => match self.frame.read_header(io)? {
                    Progress::Ready(header) => {
                        self.header_parsed = true;
                        self.header = Some(header);
                        self.state = State::ReadBody;
                    }
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::ReadBody => match self.frame.read_body(io)? {
                    Progress::Ready(body) => {
                        let Some(header) = self.header.take() else {
                            return Err(closed_by_peer());
                        };
                        match handle_response(cmd, header, &body)? {
                            Flow::Done => self.state = State::Done,
                            Flow::More => self.state = State::ReadHeader,
                        }
                    }
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::Done => return Ok(Progress::Ready(())),
                _ => {
                    if let Progress::Wait(interest) = self.setup(io)? {
                        return Ok(Progress::Wait(interest));
                    }
                }
            }
        }
    }

    /// Drives connection setup (connect, TLS, authentication) only.
    /// `Ready` once the connection can carry a request.
    pub fn setup<I: CommandIo>(&mut self, io: &mut I) -> Result<Progress<()>, ClientError> {
        loop {
            match self.state {
                State::Connecting => {
                    if !io.connected()? {
                        return Ok(Progress::Wait(Interest::Write));
                    }
                    self.state = if self.tls {
                        State::TlsHandshake
                    } else {
                        self.after_handshake()
                    };
                }
                State::TlsHandshake => match io.handshake()? {
                    IoStatus::Ready(_) => self.state = self.after_handshake(),
                    IoStatus::WantRead => return Ok(Progress::Wait(Interest::Read)),
                    IoStatus::WantWrite => return Ok(Progress::Wait(Interest::Write)),
                },
                State::AuthWrite => match self.auth.poll(io)? {
                    Progress::Ready(()) => {
                        self.frame = Frame::new(MAX_AUTH_RESPONSE);
                        self.state = State::AuthReadHeader;
                    }
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::AuthReadHeader => match self.frame.read_header(io)? {
                    Progress::Ready(_) => self.state = State::AuthReadBody,
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::AuthReadBody => match self.frame.read_body(io)? {
                    Progress::Ready(body) => {
                        let code = admin::parse_response(&body)?;
                        if code != ResultCode::Ok {
                            return Err(ClientError::Auth(code));
                        }
                        self.frame = Frame::new(MAX_RESPONSE_SIZE);
                        self.state = self.after_setup();
                    }
                    Progress::Wait(interest) => return Ok(Progress::Wait(interest)),
                },
                State::CommandWrite | State::ReadHeader | State::ReadBody | State::Done => {
                    return Ok(Progress::Ready(()))
                }
            }
        }
    }

    fn after_handshake(&self) -> State {
        if self.auth.is_empty() {
            self.after_setup()
        } else {
            State::AuthWrite
        }
    }

    fn after_setup(&self) -> State {
        if self.request.is_empty() {
            State::Done
        } else {
            State::CommandWrite
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    use spire_protocol::Value;

    use crate::command::tests::{key, response};
    use crate::command::{Operation, SingleCommand};

    /// A scripted socket. Each read or write consumes the next scripted
    /// status; `Ready` reads hand out bytes from `inbound`.
    #[derive(Default)]
    pub(crate) struct MockIo {
        pub reads: VecDeque<IoStatus>,
        pub writes: VecDeque<IoStatus>,
        pub handshakes: VecDeque<IoStatus>,
        pub inbound: VecDeque<u8>,
        pub written: Vec<u8>,
        pub write_calls: usize,
    }

    impl CommandIo for MockIo {
        fn connected(&mut self) -> Result<bool, ClientError> {
            Ok(true)
        }

        fn handshake(&mut self) -> Result<IoStatus, ClientError> {
            Ok(self.handshakes.pop_front().unwrap_or(IoStatus::Ready(0)))
        }

        fn write(&mut self, buf: &[u8]) -> Result<IoStatus, ClientError> {
            self.write_calls += 1;
            match self.writes.pop_front() {
                Some(IoStatus::Ready(n)) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(IoStatus::Ready(n))
                }
                Some(other) => Ok(other),
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(IoStatus::Ready(buf.len()))
                }
            }
        }

        fn flush(&mut self) -> Result<IoStatus, ClientError> {
            Ok(IoStatus::Ready(0))
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, ClientError> {
            match self.reads.pop_front() {
                Some(IoStatus::Ready(_)) | None => {
                    let n = buf.len().min(self.inbound.len());
                    for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
                        *slot = byte;
                    }
                    Ok(IoStatus::Ready(n))
                }
                Some(other) => Ok(other),
            }
        }

        fn pending(&mut self) -> bool {
            false
        }

        async fn wait(&self, _interest: Interest) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn get() -> SingleCommand {
        SingleCommand::new(key(), 4096, Operation::Get { bins: vec![] })
    }

    fn request() -> Bytes {
        Bytes::from_static(&[2, 3, 0, 0, 0, 0, 0, 2, 0xaa, 0xbb])
    }

    #[test]
    fn would_block_in_read_header_resumes_without_resending() {
        let mut io = MockIo::default();
        io.reads.push_back(IoStatus::WantRead);
        let mut cmd = get();
        let mut machine = Machine::pooled(request());

        let step = machine.resume(&mut io, &mut cmd).unwrap();
        assert_eq!(step, Progress::Wait(Interest::Read));
        assert_eq!(machine.state(), State::ReadHeader);
        assert!(machine.sent());
        assert!(!machine.header_parsed());
        assert_eq!(io.write_calls, 1);

        io.inbound
            .extend(response(ResultCode::Ok, &[("n", Value::Int(3))]).iter());
        let step = machine.resume(&mut io, &mut cmd).unwrap();
        assert_eq!(step, Progress::Ready(()));
        assert_eq!(machine.state(), State::Done);
        assert_eq!(io.write_calls, 1);
        assert_eq!(io.written, request().to_vec());
        assert_eq!(cmd.into_record().unwrap().get("n"), Some(&Value::Int(3)));
    }

    #[test]
    fn partial_writes_continue_where_they_stopped() {
        let mut io = MockIo::default();
        io.writes.extend([
            IoStatus::Ready(3),
            IoStatus::WantWrite,
            IoStatus::Ready(4),
        ]);
        io.inbound.extend(response(ResultCode::Ok, &[]).iter());
        let mut cmd = get();
        let mut machine = Machine::pooled(request());

        assert_eq!(
            machine.resume(&mut io, &mut cmd).unwrap(),
            Progress::Wait(Interest::Write)
        );
        assert!(!machine.sent());
        assert_eq!(machine.resume(&mut io, &mut cmd).unwrap(), Progress::Ready(()));
        assert_eq!(io.written, request().to_vec());
    }

    #[test]
    fn tls_handshake_honors_the_direction_it_asks_for() {
        let mut io = MockIo::default();
        io.handshakes
            .extend([IoStatus::WantWrite, IoStatus::WantRead, IoStatus::Ready(0)]);
        io.inbound.extend(response(ResultCode::Ok, &[]).iter());
        let mut cmd = get();
        let mut machine = Machine::connecting(request(), true, None);

        assert_eq!(
            machine.resume(&mut io, &mut cmd).unwrap(),
            Progress::Wait(Interest::Write)
        );
        assert_eq!(machine.state(), State::TlsHandshake);
        assert_eq!(
            machine.resume(&mut io, &mut cmd).unwrap(),
            Progress::Wait(Interest::Read)
        );
        assert_eq!(machine.state(), State::TlsHandshake);
        assert_eq!(machine.resume(&mut io, &mut cmd).unwrap(), Progress::Ready(()));
        assert_eq!(io.write_calls, 1);
    }

    #[test]
    fn authentication_precedes_the_command() {
        let mut auth = BytesMut::new();
        admin::encode_authenticate("app", b"hash", &mut auth).unwrap();
        let mut io = MockIo::default();
        let mut reply = BytesMut::new();
        admin::encode_response(0, &mut reply).unwrap();
        io.inbound.extend(reply.iter());
        io.inbound.extend(response(ResultCode::Ok, &[]).iter());

        let mut cmd = get();
        let mut machine = Machine::connecting(request(), false, Some(auth.clone().freeze()));
        assert_eq!(machine.resume(&mut io, &mut cmd).unwrap(), Progress::Ready(()));

        let mut expected = auth.to_vec();
        expected.extend_from_slice(&request());
        assert_eq!(io.written, expected);
    }

    #[test]
    fn rejected_authentication_fails_the_attempt() {
        let mut auth = BytesMut::new();
        admin::encode_authenticate("app", b"wrong", &mut auth).unwrap();
        let mut io = MockIo::default();
        let mut reply = BytesMut::new();
        admin::encode_response(ResultCode::InvalidCredential.code() as u8, &mut reply).unwrap();
        io.inbound.extend(reply.iter());

        let mut machine = Machine::connecting(request(), false, Some(auth.freeze()));
        let err = machine.resume(&mut io, &mut get()).unwrap_err();
        assert!(matches!(err, ClientError::Auth(ResultCode::InvalidCredential)));
        assert!(!machine.sent());
    }

    #[test]
    fn empty_request_stops_after_setup() {
        let mut io = MockIo::default();
        let mut machine = Machine::connecting(Bytes::new(), false, None);
        assert_eq!(machine.setup(&mut io).unwrap(), Progress::Ready(()));
        assert_eq!(machine.state(), State::Done);
        assert_eq!(io.write_calls, 0);
    }

    #[test]
    fn peer_close_mid_body_is_a_connection_error() {
        let mut io = MockIo::default();
        let wire = response(ResultCode::Ok, &[("n", Value::Int(1))]);
        io.inbound.extend(wire[..wire.len() - 2].iter());
        let mut machine = Machine::pooled(request());
        let err = machine.resume(&mut io, &mut get()).unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
        assert!(machine.header_parsed());
    }
}
