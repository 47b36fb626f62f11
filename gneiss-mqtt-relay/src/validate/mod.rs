/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Validation of user-supplied messages, topic filters, identifiers and connect options.  Every
failure is an InvalidArgument error and leaves client state untouched.
 */

pub(crate) mod utils;

use crate::config::ConnectOptions;
use crate::error::{MqttError, MqttResult};
use crate::message::Message;

use log::*;

pub(crate) use utils::*;

/// Maximum length, in bytes, of any UTF-8 string field
pub(crate) const MAXIMUM_STRING_LENGTH: usize = 65535;

/// Largest payload a single MQTT packet can carry
pub(crate) const MAXIMUM_PAYLOAD_LENGTH: usize = 268_435_455;

pub(crate) fn validate_message(message: &Message, context_name: &str) -> MqttResult<()> {
    if !is_valid_topic(&message.destination) {
        error!("{} Validation - invalid destination topic \"{}\"", context_name, message.destination);
        return Err(MqttError::new_invalid_argument(format!("{} destination topic is not a valid topic", context_name)));
    }

    if message.payload.len() > MAXIMUM_PAYLOAD_LENGTH {
        error!("{} Validation - payload too large", context_name);
        return Err(MqttError::new_invalid_argument(format!("{} payload too large", context_name)));
    }

    Ok(())
}

pub(crate) fn validate_topic_filter(filter: &str, context_name: &str) -> MqttResult<()> {
    if !is_valid_topic_filter(filter) {
        error!("{} Validation - invalid topic filter \"{}\"", context_name, filter);
        return Err(MqttError::new_invalid_argument(format!("{} topic filter is not valid", context_name)));
    }

    Ok(())
}

pub(crate) fn validate_broker_alias(broker_alias: &str) -> MqttResult<()> {
    if broker_alias.is_empty() {
        error!("Client Validation - empty broker alias");
        return Err(MqttError::new_invalid_argument("broker alias may not be empty"));
    }

    validate_string_length(broker_alias, "Client", "broker_alias")
}

pub(crate) fn validate_client_id(client_id: &Option<String>) -> MqttResult<()> {
    if let Some(client_id) = client_id {
        if client_id.is_empty() {
            error!("Client Validation - empty client id");
            return Err(MqttError::new_invalid_argument("client id may not be empty; omit it to use a shared connection"));
        }
    }

    validate_optional_string_length(client_id, "Client", "client_id")
}

pub(crate) fn validate_connect_options(options: &ConnectOptions, is_shared: bool) -> MqttResult<()> {
    validate_optional_string_length(&options.username, "Connect", "username")?;
    validate_optional_binary_length(&options.password, "Connect", "password")?;

    if options.password.is_some() && options.username.is_none() {
        error!("Connect Validation - password set without username");
        return Err(MqttError::new_invalid_argument("password requires a username"));
    }

    if is_shared && !options.clean_session {
        error!("Connect Validation - shared connections require a clean session");
        return Err(MqttError::new_invalid_argument("persistent sessions require an explicit client id"));
    }

    if let Some(will) = &options.will {
        validate_message(will, "Connect will")?;
    }

    Ok(())
}
