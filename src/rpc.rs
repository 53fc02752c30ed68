//! The RPC stub contract. Like the transport adapter, this is explicitly an
//! external collaborator: the session-lifecycle core only ever depends on the [`RpcStub`] trait,
//! so that the generated `authenticate`/`execute`/`signout` stub (not part of this crate) can be
//! swapped in without touching `Connection`. [`BincodeRpcStub`] is a reference implementation
//! that frames requests over a [`Transport`] using `bincode`; tests substitute a hand-rolled
//! mock that implements [`RpcStub`] directly.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    options::DEFAULT_SESSION_INVALIDATED_CODE,
    runtime,
    transport::Transport,
};

/// A server-issued, opaque session handle. NebulaGraph-style backends hand out an `i64`; this
/// crate treats the value as opaque beyond equality and null-ness.
pub type SessionId = i64;

/// Query metrics the server may attach to an `execute` response.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryMetrics {
    /// Milliseconds the server spent executing the statement.
    pub execute_millis: u64,
    /// Milliseconds the server spent traversing the graph.
    pub traverse_millis: u64,
}

/// Response to an `authenticate` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub error_code: i32,
    pub error_msg: String,
    pub session_id: Option<SessionId>,
}

/// Response to an `execute` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub error_code: i32,
    pub error_msg: String,
    pub data: Vec<u8>,
    pub metrics: Option<QueryMetrics>,
}

impl ExecuteResponse {
    pub(crate) fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

#[derive(Serialize, Deserialize)]
struct AuthenticateRequest<'a> {
    user: &'a str,
    password: &'a str,
}

#[derive(Serialize, Deserialize)]
struct ExecuteRequest {
    session_id: SessionId,
    statement: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SignoutRequest {
    session_id: SessionId,
}

/// Typed RPC calls layered over a [`Transport`]. Every call must honor the
/// deadline passed in by the `Connection` layer.
#[async_trait]
pub(crate) trait RpcStub: Send {
    async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<AuthenticateResponse>;

    async fn execute(
        &self,
        transport: &mut dyn Transport,
        session_id: SessionId,
        statement: &[u8],
        deadline: Instant,
    ) -> Result<ExecuteResponse>;

    async fn signout(
        &self,
        transport: &mut dyn Transport,
        session_id: SessionId,
        deadline: Instant,
    ) -> Result<()>;
}

/// Reference [`RpcStub`] implementation: `bincode`-encodes each request behind a one-byte opcode
/// prefix and a length-delimited frame supplied by the [`Transport`].
pub(crate) struct BincodeRpcStub {
    pub session_invalidated_codes: std::collections::HashSet<i32>,
}

impl Default for BincodeRpcStub {
    fn default() -> Self {
        Self {
            session_invalidated_codes: std::collections::HashSet::from([
                DEFAULT_SESSION_INVALIDATED_CODE,
            ]),
        }
    }
}

const OP_AUTHENTICATE: u8 = 1;
const OP_EXECUTE: u8 = 2;
const OP_SIGNOUT: u8 = 3;

impl BincodeRpcStub {
    async fn call_with_deadline<Req, Resp>(
        &self,
        transport: &mut dyn Transport,
        opcode: u8,
        request: &Req,
        deadline: Instant,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::timeout());
        }
        let encoded =
            bincode::serialize(request).map_err(|e| Error::transport(format!("encode: {e}")))?;
        let mut frame = Vec::with_capacity(encoded.len() + 1);
        frame.push(opcode);
        frame.extend_from_slice(&encoded);

        runtime::timeout(remaining, async {
            transport.send_frame(&frame).await?;
            let reply = transport.recv_frame().await?;
            bincode::deserialize::<Resp>(&reply)
                .map_err(|e| Error::transport(format!("decode: {e}")))
        })
        .await
        .map_err(|_| Error::timeout())?
    }
}

#[async_trait]
impl RpcStub for BincodeRpcStub {
    async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        user: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<AuthenticateResponse> {
        self.call_with_deadline(
            transport,
            OP_AUTHENTICATE,
            &AuthenticateRequest { user, password },
            deadline,
        )
        .await
    }

    async fn execute(
        &self,
        transport: &mut dyn Transport,
        session_id: SessionId,
        statement: &[u8],
        deadline: Instant,
    ) -> Result<ExecuteResponse> {
        self.call_with_deadline(
            transport,
            OP_EXECUTE,
            &ExecuteRequest {
                session_id,
                statement: statement.to_vec(),
            },
            deadline,
        )
        .await
    }

    async fn signout(
        &self,
        transport: &mut dyn Transport,
        session_id: SessionId,
        deadline: Instant,
    ) -> Result<()> {
        self.call_with_deadline::<_, ()>(transport, OP_SIGNOUT, &SignoutRequest { session_id }, deadline)
            .await
    }
}

/// The heartbeat probe statement.
pub(crate) const YIELD_ONE: &[u8] = b"YIELD 1";
