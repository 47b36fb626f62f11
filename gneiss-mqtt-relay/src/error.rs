/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::PacketType;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Low-level error code attached to every failure of the push transport itself.
pub const TRANSPORT_FAILURE_CODE: i32 = 10;

/// Server denial code signalling that an access-control hook rejected the request.
pub const DENIAL_CODE_NOT_AUTHORIZED: i32 = -1;

/// Server denial code signalling that the broker alias is not configured on the server.
pub const DENIAL_CODE_UNKNOWN_BROKER: i32 = -2;

/// Server denial code signalling a generic server-side configuration problem.
pub const DENIAL_CODE_CONFIGURATION: i32 = -3;

/// Server denial code signalling that a shared-subscription selector is already in use.
pub const DENIAL_CODE_CONFLICTING_SELECTOR: i32 = -4;

type ErrorSource = Arc<dyn Error + Send + Sync + 'static>;

fn into_source(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> ErrorSource {
    Arc::from(source.into())
}

/// Additional details about an InvalidArgument error variant
#[derive(Clone, Debug)]
pub struct InvalidArgumentContext {
    source: ErrorSource
}

/// Additional details about an InvalidState error variant
#[derive(Clone, Debug)]
pub struct InvalidStateContext {
    source: ErrorSource
}

/// Additional details about a BrokerRejection error variant
#[derive(Clone, Debug)]
pub struct BrokerRejectionContext {

    /// type of the acknowledgement packet that carried the failure code
    pub packet_type: PacketType,

    /// raw failure code from the acknowledgement
    pub code: u8,
}

/// Additional details about a denial reported by the server on behalf of the broker connection.
#[derive(Clone, Debug)]
pub struct DenialContext {

    /// negative denial code reported by the server
    pub code: i32,

    /// opaque message attached to the denial, if any
    pub message: Option<String>,
}

/// Additional details about a ServerError error variant
#[derive(Clone, Debug)]
pub struct ServerErrorContext {

    /// positive error code reported by the server
    pub code: i32,

    /// opaque message attached to the error, if any
    pub message: Option<String>,
}

/// Additional details about a TransportFailure error variant
#[derive(Clone, Debug)]
pub struct TransportFailureContext {
    source: ErrorSource
}

/// Additional details about a ConnectionClosed error variant
#[derive(Clone, Debug)]
pub struct ConnectionClosedContext {
    source: ErrorSource
}

/// Additional details about a ProtocolError error variant
#[derive(Clone, Debug)]
pub struct ProtocolErrorContext {
    source: ErrorSource
}

/// Additional details about a StorageFailure error variant
#[derive(Clone, Debug)]
pub struct StorageFailureContext {
    source: ErrorSource
}

/// Additional details about an InternalStateError error variant
#[derive(Clone, Debug)]
pub struct InternalStateErrorContext {
    source: ErrorSource
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Clone, Debug)]
pub struct UserInitiatedDisconnectContext {
}

/// Additional details about a ClientClosed error variant
#[derive(Clone, Debug)]
pub struct ClientClosedContext {
}

/// Basic error type for the entire gneiss-mqtt-relay crate.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum MqttError {

    /// Malformed input to a public API call.  No client state was changed.
    InvalidArgument(InvalidArgumentContext),

    /// The operation is not permitted in the client's current connection state.  No client state
    /// was changed.
    InvalidState(InvalidStateContext),

    /// The broker answered a CONNECT or SUBSCRIBE with a failure code.
    BrokerRejection(BrokerRejectionContext),

    /// An access-control hook on the server rejected a connect, publish or subscribe.
    NotAuthorized(DenialContext),

    /// The server rejected the request because of its configuration (for example, an unknown
    /// broker alias).
    ConfigurationError(DenialContext),

    /// The server rejected a shared subscription because its selector is already in use.
    ConflictingSelector(DenialContext),

    /// Generic server-side error carrying an opaque message.
    ServerError(ServerErrorContext),

    /// The push transport is unreachable or reported a terminal failure.
    TransportFailure(TransportFailureContext),

    /// The server closed the client's connection stream.
    ConnectionClosed(ConnectionClosedContext),

    /// The broker (or server) behaved in a way that broke the MQTT acknowledgement protocol.  Never
    /// retried.
    ProtocolError(ProtocolErrorContext),

    /// The session storage backend failed or contained unreadable data.
    StorageFailure(StorageFailureContext),

    /// The client reached an invalid internal state; almost certainly a client bug.
    InternalStateError(InternalStateErrorContext),

    /// The operation was cancelled because the user disconnected the client.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// The operation was cancelled because the client or its session was closed.
    ClientClosed(ClientClosedContext),
}

impl MqttError {

    pub(crate) fn new_invalid_argument(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InvalidArgument(
            InvalidArgumentContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_invalid_state(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InvalidState(
            InvalidStateContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_broker_rejection(packet_type: PacketType, code: u8) -> Self {
        MqttError::BrokerRejection(
            BrokerRejectionContext {
                packet_type,
                code
            }
        )
    }

    pub(crate) fn new_not_authorized(code: i32, message: Option<String>) -> Self {
        MqttError::NotAuthorized(
            DenialContext {
                code,
                message
            }
        )
    }

    pub(crate) fn new_configuration_error(code: i32, message: Option<String>) -> Self {
        MqttError::ConfigurationError(
            DenialContext {
                code,
                message
            }
        )
    }

    pub(crate) fn new_conflicting_selector(code: i32, message: Option<String>) -> Self {
        MqttError::ConflictingSelector(
            DenialContext {
                code,
                message
            }
        )
    }

    pub(crate) fn new_server_error(code: i32, message: Option<String>) -> Self {
        MqttError::ServerError(
            ServerErrorContext {
                code,
                message
            }
        )
    }

    pub(crate) fn new_transport_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::TransportFailure(
            TransportFailureContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ConnectionClosed(
            ConnectionClosedContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ProtocolError(
            ProtocolErrorContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_storage_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::StorageFailure(
            StorageFailureContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InternalStateError(
            InternalStateErrorContext {
                source : into_source(source)
            }
        )
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        MqttError::UserInitiatedDisconnect(
            UserInitiatedDisconnectContext {}
        )
    }

    pub(crate) fn new_client_closed() -> Self {
        MqttError::ClientClosed(
            ClientClosedContext {}
        )
    }

    /// Returns the structured numeric code carried by this error, if it has one.
    ///
    /// Server denials yield their negative code, server errors their positive code, broker
    /// rejections the raw acknowledgement code and transport failures [`TRANSPORT_FAILURE_CODE`].
    pub fn code(&self) -> Option<i32> {
        match self {
            MqttError::BrokerRejection(context) => { Some(context.code as i32) }
            MqttError::NotAuthorized(context) |
            MqttError::ConfigurationError(context) |
            MqttError::ConflictingSelector(context) => { Some(context.code) }
            MqttError::ServerError(context) => { Some(context.code) }
            MqttError::TransportFailure(_) => { Some(TRANSPORT_FAILURE_CODE) }
            _ => { None }
        }
    }

    /// Returns true if this error is an authorization denial.  Authorization denials are
    /// surfaced through the not-authorized paths rather than generic failure paths.
    pub fn is_authorization_denial(&self) -> bool {
        matches!(self, MqttError::NotAuthorized(_))
    }
}

/// Maps a server-reported (code, message) pair onto the crate error taxonomy.
///
/// Negative codes are denials, positive codes are generic server errors.
pub fn classify_server_error(code: i32, message: Option<String>) -> MqttError {
    match code {
        DENIAL_CODE_NOT_AUTHORIZED => { MqttError::new_not_authorized(code, message) }
        DENIAL_CODE_CONFLICTING_SELECTOR => { MqttError::new_conflicting_selector(code, message) }
        DENIAL_CODE_UNKNOWN_BROKER | DENIAL_CODE_CONFIGURATION => { MqttError::new_configuration_error(code, message) }
        _ if code < 0 => { MqttError::new_configuration_error(code, message) }
        _ => { MqttError::new_server_error(code, message) }
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::InvalidArgument(context) => {
                Some(context.source.as_ref())
            }
            MqttError::InvalidState(context) => {
                Some(context.source.as_ref())
            }
            MqttError::TransportFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ProtocolError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::StorageFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

fn write_optional_message(f: &mut fmt::Formatter<'_>, message: &Option<String>) -> fmt::Result {
    if let Some(message) = message {
        write!(f, ": {}", message)?;
    }

    Ok(())
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::InvalidArgument(context) => {
                write!(f, "invalid argument: {}", context.source)
            }
            MqttError::InvalidState(context) => {
                write!(f, "operation not allowed in the current client state: {}", context.source)
            }
            MqttError::BrokerRejection(context) => {
                write!(f, "broker rejected the request with {} code {}", context.packet_type, context.code)
            }
            MqttError::NotAuthorized(context) => {
                write!(f, "request not authorized (code {})", context.code)?;
                write_optional_message(f, &context.message)
            }
            MqttError::ConfigurationError(context) => {
                write!(f, "server configuration error (code {})", context.code)?;
                write_optional_message(f, &context.message)
            }
            MqttError::ConflictingSelector(context) => {
                write!(f, "conflicting subscription selector (code {})", context.code)?;
                write_optional_message(f, &context.message)
            }
            MqttError::ServerError(context) => {
                write!(f, "server error (code {})", context.code)?;
                write_optional_message(f, &context.message)
            }
            MqttError::TransportFailure(_) => {
                write!(f, "push transport failure (code {}); source contains further details", TRANSPORT_FAILURE_CODE)
            }
            MqttError::ConnectionClosed(_) => {
                write!(f, "client connection was closed; source contains further details")
            }
            MqttError::ProtocolError(_) => {
                write!(f, "broker behavior broke the mqtt acknowledgement protocol")
            }
            MqttError::StorageFailure(_) => {
                write!(f, "session storage failure; source contains further details")
            }
            MqttError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
            MqttError::UserInitiatedDisconnect(_) => {
                write!(f, "operation cancelled due to user-initiated disconnect")
            }
            MqttError::ClientClosed(_) => {
                write!(f, "operation cancelled because the client was closed")
            }
        }
    }
}

impl From<serde_json::Error> for MqttError {
    fn from(err: serde_json::Error) -> Self {
        MqttError::new_storage_failure(err)
    }
}

impl From<futures::channel::oneshot::Canceled> for MqttError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        MqttError::new_client_closed()
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttResult<T> = Result<T, MqttError>;
