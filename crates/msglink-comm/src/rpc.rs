//! Request/response correlation over a pair of channels.
//!
//! Every request carries a process-unique id and the address of the channel
//! its response must be sent to. The client matches responses oldest-first:
//! a response for a newer outstanding request is stashed until its turn, and
//! a response for an id that was never issued is a hard error. The server
//! keeps one responder channel per distinct response address and discards
//! each pending entry exactly once, when its reply goes out.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use msglink_schema::Value;
use msglink_transport::Role;

use crate::address::{self, Direction};
use crate::comm::{CommConfig, CommRecv, Communicator, RpcMeta};
use crate::error::{CommError, Result};
use crate::state;

/// Client endpoint: sends requests, receives correlated responses.
#[derive(Debug)]
pub struct RpcClient {
    request: Communicator,
    response: Option<Communicator>,
    outstanding: VecDeque<String>,
    stashed: HashMap<String, Vec<Value>>,
}

impl RpcClient {
    pub fn from_env(name: &str) -> Result<Self> {
        Self::from_env_with(name, CommConfig::default())
    }

    pub fn from_env_with(name: &str, config: CommConfig) -> Result<Self> {
        let request =
            Communicator::from_env_with(name, Direction::Send, config.with_role(Role::Client))?;
        Ok(Self::over(request))
    }

    pub fn open_at(name: &str, address: &str, config: CommConfig) -> Result<Self> {
        let request = Communicator::open_at(
            name,
            Direction::Send,
            address,
            config.with_role(Role::Client),
        )?;
        Ok(Self::over(request))
    }

    /// Wrap an already-open send channel.
    pub fn over(request: Communicator) -> Self {
        Self {
            request,
            response: None,
            outstanding: VecDeque::new(),
            stashed: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.request.name()
    }

    /// Requests sent whose responses have not yet been consumed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn ensure_response(&mut self) -> Result<String> {
        if self.response.is_none() {
            let kind = self.request.kind();
            let name = format!("{}_resp", self.request.name());
            let address = address::generate(kind, &name)?;
            let comm = Communicator::open_at(
                &name,
                Direction::Recv,
                &address,
                CommConfig::default().with_kind(kind).with_role(Role::Client),
            )?;
            debug!(name = %name, address = %comm.address(), "response channel open");
            self.response = Some(comm);
        }
        Ok(self
            .response
            .as_ref()
            .map(|c| c.address().to_string())
            .unwrap_or_default())
    }

    /// Send one request; returns the id its response will carry.
    pub fn request(&mut self, values: &[Value]) -> Result<String> {
        let response_address = self.ensure_response()?;
        let id = state::next_request_id();
        self.request.send_with(
            values,
            Some(RpcMeta {
                request_id: id.clone(),
                response_address: Some(response_address),
            }),
        )?;
        self.outstanding.push_back(id.clone());
        trace!(id = %id, "request sent");
        Ok(id)
    }

    /// Receive the response to the oldest outstanding request.
    pub fn response(&mut self) -> Result<CommRecv> {
        let oldest = self
            .outstanding
            .front()
            .cloned()
            .ok_or(CommError::NoPendingRequest)?;

        if let Some(values) = self.stashed.remove(&oldest) {
            self.outstanding.pop_front();
            trace!(id = %oldest, "response taken from stash");
            return Ok(CommRecv::Values(values));
        }

        let response = self
            .response
            .as_mut()
            .ok_or(CommError::NoPendingRequest)?;
        loop {
            let (recv, meta) = response.recv_with_meta()?;
            let values = match recv {
                CommRecv::Eof => return Ok(CommRecv::Eof),
                CommRecv::Values(values) => values,
            };
            let meta = meta.ok_or(CommError::MissingCorrelation)?;
            if meta.request_id == oldest {
                self.outstanding.pop_front();
                trace!(id = %oldest, "response matched");
                return Ok(CommRecv::Values(values));
            }
            if self.outstanding.contains(&meta.request_id) {
                trace!(id = %meta.request_id, "out-of-order response stashed");
                self.stashed.insert(meta.request_id, values);
                continue;
            }
            return Err(CommError::UnknownRequest(meta.request_id));
        }
    }

    /// Send one request and block for its response.
    pub fn call(&mut self, values: &[Value]) -> Result<CommRecv> {
        self.request(values)?;
        self.response()
    }

    pub fn close(&mut self) -> Result<()> {
        self.request.close()?;
        if let Some(response) = &mut self.response {
            response.close()?;
        }
        Ok(())
    }
}

/// Server endpoint: receives requests, sends correlated replies.
#[derive(Debug)]
pub struct RpcServer {
    request: Communicator,
    response_config: CommConfig,
    pending: VecDeque<(String, String)>,
    responders: HashMap<String, Communicator>,
}

impl RpcServer {
    pub fn from_env(name: &str) -> Result<Self> {
        Self::from_env_with(name, CommConfig::default(), CommConfig::default())
    }

    pub fn from_env_with(
        name: &str,
        request_config: CommConfig,
        response_config: CommConfig,
    ) -> Result<Self> {
        let request = Communicator::from_env_with(
            name,
            Direction::Recv,
            request_config
                .with_role(Role::Server)
                .with_multiple_connections(),
        )?;
        Ok(Self::over(request, response_config))
    }

    pub fn open_at(
        name: &str,
        address: &str,
        request_config: CommConfig,
        response_config: CommConfig,
    ) -> Result<Self> {
        let request = Communicator::open_at(
            name,
            Direction::Recv,
            address,
            request_config
                .with_role(Role::Server)
                .with_multiple_connections(),
        )?;
        Ok(Self::over(request, response_config))
    }

    /// Wrap an already-open receive channel.
    pub fn over(request: Communicator, response_config: CommConfig) -> Self {
        Self {
            request,
            response_config,
            pending: VecDeque::new(),
            responders: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.request.name()
    }

    pub fn address(&self) -> &str {
        self.request.address()
    }

    /// Requests received but not yet replied to.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether a given request id is still awaiting its reply.
    pub fn has_pending(&self, request_id: &str) -> bool {
        self.pending.iter().any(|(id, _)| id == request_id)
    }

    /// Receive one request, recording its correlation entry.
    pub fn recv_request(&mut self) -> Result<CommRecv> {
        let (recv, meta) = self.request.recv_with_meta()?;
        if matches!(recv, CommRecv::Values(_)) {
            let meta = meta.ok_or(CommError::MissingCorrelation)?;
            let address = meta
                .response_address
                .ok_or(CommError::MissingCorrelation)?;
            trace!(id = %meta.request_id, response = %address, "request received");
            self.pending.push_back((meta.request_id, address));
        }
        Ok(recv)
    }

    /// Reply to the oldest pending request.
    pub fn send_reply(&mut self, values: &[Value]) -> Result<()> {
        let (request_id, address) =
            self.pending.pop_front().ok_or(CommError::NoPendingRequest)?;
        self.reply_on(request_id, address, values)
    }

    /// Reply to one specific pending request, out of arrival order.
    pub fn send_reply_to(&mut self, request_id: &str, values: &[Value]) -> Result<()> {
        let position = self
            .pending
            .iter()
            .position(|(id, _)| id == request_id)
            .ok_or_else(|| CommError::UnknownRequest(request_id.to_string()))?;
        let (request_id, address) = self.pending.remove(position).ok_or_else(|| {
            CommError::UnknownRequest(request_id.to_string())
        })?;
        self.reply_on(request_id, address, values)
    }

    fn reply_on(&mut self, request_id: String, address: String, values: &[Value]) -> Result<()> {
        let kind = self.request.kind();
        let name = format!("{}_resp", self.request.name());
        let responder = match self.responders.get_mut(&address) {
            Some(responder) => responder,
            None => {
                let comm = Communicator::open_at(
                    &name,
                    Direction::Send,
                    &address,
                    self.response_config.clone().with_kind(kind),
                )?;
                debug!(address = %address, "responder channel open");
                self.responders.entry(address.clone()).or_insert(comm)
            }
        };
        responder.send_with(
            values,
            Some(RpcMeta {
                request_id: request_id.clone(),
                response_address: None,
            }),
        )?;
        trace!(id = %request_id, "reply sent");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        for (_, responder) in self.responders.iter_mut() {
            responder.close()?;
        }
        self.request.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use msglink_schema::{ScalarKind, TypeDescriptor};
    use msglink_transport::TransportKind;

    use super::*;

    fn file_pair(tag: &str) -> (RpcClient, RpcServer) {
        let request_path = address::generate(TransportKind::File, tag).unwrap();
        let descriptor = TypeDescriptor::Scalar {
            kind: ScalarKind::Int,
            precision: 64,
            units: None,
        };
        let client = RpcClient::open_at(
            tag,
            &request_path,
            CommConfig::default()
                .with_kind(TransportKind::File)
                .with_datatype(descriptor),
        )
        .unwrap();
        let server = RpcServer::open_at(
            tag,
            &request_path,
            CommConfig::default().with_kind(TransportKind::File),
            CommConfig::default(),
        )
        .unwrap();
        (client, server)
    }

    #[test]
    fn call_round_trips_through_a_server() {
        let (mut client, mut server) = file_pair("rpc_basic");

        let id = client.request(&[Value::Int(21)]).unwrap();
        let CommRecv::Values(request) = server.recv_request().unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request, vec![Value::Int(21)]);
        assert!(server.has_pending(&id));

        server
            .send_reply(&[Value::Bytes(b"doubled:42".to_vec())])
            .unwrap();
        assert!(!server.has_pending(&id));

        assert_eq!(
            client.response().unwrap(),
            CommRecv::Values(vec![Value::Bytes(b"doubled:42".to_vec())])
        );
        assert_eq!(client.outstanding(), 0);
        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn out_of_order_responses_are_delivered_oldest_first() {
        let (mut client, mut server) = file_pair("rpc_order");

        let r1 = client.request(&[Value::Int(1)]).unwrap();
        let r2 = client.request(&[Value::Int(2)]).unwrap();
        server.recv_request().unwrap();
        server.recv_request().unwrap();

        // Replies go out newest-first; the client still sees oldest-first.
        server
            .send_reply_to(&r2, &[Value::Bytes(b"two".to_vec())])
            .unwrap();
        server
            .send_reply_to(&r1, &[Value::Bytes(b"one".to_vec())])
            .unwrap();

        assert_eq!(
            client.response().unwrap(),
            CommRecv::Values(vec![Value::Bytes(b"one".to_vec())])
        );
        assert_eq!(
            client.response().unwrap(),
            CommRecv::Values(vec![Value::Bytes(b"two".to_vec())])
        );
        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn response_without_a_request_is_an_error() {
        let request_path = address::generate(TransportKind::File, "rpc_none").unwrap();
        let mut client = RpcClient::open_at(
            "rpc_none",
            &request_path,
            CommConfig::default().with_kind(TransportKind::File),
        )
        .unwrap();
        assert!(matches!(
            client.response(),
            Err(CommError::NoPendingRequest)
        ));
        client.close().unwrap();
    }

    #[test]
    fn replying_with_nothing_pending_is_an_error() {
        let request_path = address::generate(TransportKind::File, "rpc_empty").unwrap();
        let mut server = RpcServer::open_at(
            "rpc_empty",
            &request_path,
            CommConfig::default().with_kind(TransportKind::File),
            CommConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            server.send_reply(&[Value::Bytes(vec![0])]),
            Err(CommError::NoPendingRequest)
        ));
        server.close().unwrap();
    }
}
