//! Inbound request surface.
//!
//! The transport itself is out of scope; the host decodes messages and hands
//! the core a [`Request`] per inbound RPC. A [`Responder`] is a multi-shot
//! sink so streaming services (journal, wait) can answer more than once, and
//! so responses can be deferred to a later batch commit without holding a
//! borrow on the core.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of the connection a request arrived on, used to drop pending
/// state when the client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller credentials attached to every request by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub userid: u32,
    pub owner: bool,
}

impl Credentials {
    pub fn owner(userid: u32) -> Self {
        Self {
            userid,
            owner: true,
        }
    }

    pub fn user(userid: u32) -> Self {
        Self {
            userid,
            owner: false,
        }
    }

    /// Instance owner may act on any job; a guest only on their own.
    pub fn may_act_on(&self, job_userid: u32) -> bool {
        self.owner || self.userid == job_userid
    }
}

/// Service-level failures, surfaced to the caller as exactly one error
/// response carrying an `errno` and a human-readable message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    StateConflict(String),

    #[error("malformed payload: {0}")]
    Protocol(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    NoChild(String),
}

impl ServiceError {
    /// POSIX-style errno for the wire, mirroring the error kinds of the
    /// services this core replaces.
    pub fn errnum(&self) -> i32 {
        match self {
            ServiceError::Validation(_) => 22,    // EINVAL
            ServiceError::Authorization(_) => 1,  // EPERM
            ServiceError::StateConflict(_) => 22, // EINVAL
            ServiceError::Protocol(_) => 71,      // EPROTO
            ServiceError::NotFound(_) => 2,       // ENOENT
            ServiceError::Unavailable(_) => 38,   // ENOSYS
            ServiceError::NoChild(_) => 10,       // ECHILD
        }
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        ServiceError::Protocol(msg.into())
    }
}

/// One response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Payload(Value),
    Error { errnum: i32, errstr: String },
}

/// Multi-shot response sink handed to the core with each request.
///
/// Cloned freely; every clone feeds the same client. Send failures mean the
/// client went away and are ignored (disconnect handling cleans up pending
/// state separately).
#[derive(Debug, Clone)]
pub struct Responder {
    client: ClientId,
    tx: mpsc::UnboundedSender<Response>,
}

impl Responder {
    pub fn new(client: ClientId) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { client, tx }, rx)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn respond(&self, payload: Value) {
        let _ = self.tx.send(Response::Payload(payload));
    }

    pub fn respond_error(&self, err: &ServiceError) {
        let _ = self.tx.send(Response::Error {
            errnum: err.errnum(),
            errstr: err.to_string(),
        });
    }

    pub fn respond_error_msg(&self, errnum: i32, errstr: impl Into<String>) {
        let _ = self.tx.send(Response::Error {
            errnum,
            errstr: errstr.into(),
        });
    }
}

/// A decoded inbound RPC.
#[derive(Debug, Clone)]
pub struct Request {
    pub topic: String,
    pub payload: Value,
    pub cred: Credentials,
    pub responder: Responder,
}

impl Request {
    /// Fetch a required payload key, mapping absence to a protocol error.
    pub fn key<'a>(&'a self, name: &str) -> Result<&'a Value, ServiceError> {
        self.payload
            .get(name)
            .ok_or_else(|| ServiceError::proto(format!("missing key '{name}'")))
    }

    pub fn key_u64(&self, name: &str) -> Result<u64, ServiceError> {
        self.key(name)?
            .as_u64()
            .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not an integer")))
    }

    pub fn key_i64(&self, name: &str) -> Result<i64, ServiceError> {
        self.key(name)?
            .as_i64()
            .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not an integer")))
    }

    pub fn key_str<'a>(&'a self, name: &str) -> Result<&'a str, ServiceError> {
        self.key(name)?
            .as_str()
            .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not a string")))
    }

    pub fn key_bool(&self, name: &str) -> Result<bool, ServiceError> {
        self.key(name)?
            .as_bool()
            .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not a bool")))
    }

    /// Optional key helpers return None when the key is absent but still
    /// reject a present key of the wrong type.
    pub fn opt_str<'a>(&'a self, name: &str) -> Result<Option<&'a str>, ServiceError> {
        match self.payload.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not a string"))),
        }
    }

    pub fn opt_bool(&self, name: &str) -> Result<Option<bool>, ServiceError> {
        match self.payload.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not a bool"))),
        }
    }

    pub fn opt_u64(&self, name: &str) -> Result<Option<u64>, ServiceError> {
        match self.payload.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not an integer"))),
        }
    }

    pub fn opt_f64(&self, name: &str) -> Result<Option<f64>, ServiceError> {
        match self.payload.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| ServiceError::proto(format!("key '{name}' is not a number"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(payload: Value) -> (Request, mpsc::UnboundedReceiver<Response>) {
        let (responder, rx) = Responder::new(ClientId::new());
        (
            Request {
                topic: "test.topic".to_string(),
                payload,
                cred: Credentials::owner(0),
                responder,
            },
            rx,
        )
    }

    #[test]
    fn owner_may_act_on_any_job() {
        let cred = Credentials::owner(0);
        assert!(cred.may_act_on(42));
    }

    #[test]
    fn guest_may_act_only_on_own_jobs() {
        let cred = Credentials::user(42);
        assert!(cred.may_act_on(42));
        assert!(!cred.may_act_on(43));
    }

    #[test]
    fn missing_key_is_protocol_error() {
        let (req, _rx) = request(json!({}));
        let err = req.key_u64("id").unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert_eq!(err.errnum(), 71);
    }

    #[test]
    fn optional_key_tolerates_absence_not_type_mismatch() {
        let (req, _rx) = request(json!({"name": 7}));
        assert_eq!(req.opt_str("reason").unwrap(), None);
        assert!(req.opt_str("name").is_err());
    }

    #[test]
    fn responder_delivers_both_frames() {
        let (responder, mut rx) = Responder::new(ClientId::new());
        responder.respond(json!({"ok": true}));
        responder.respond_error(&ServiceError::NotFound("no such job".into()));
        assert_eq!(rx.try_recv().unwrap(), Response::Payload(json!({"ok": true})));
        match rx.try_recv().unwrap() {
            Response::Error { errnum, errstr } => {
                assert_eq!(errnum, 2);
                assert_eq!(errstr, "no such job");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
