/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{MqttError, MqttResult};
use crate::validate::MAXIMUM_STRING_LENGTH;

use log::*;

pub(crate) fn validate_string_length(value: &str, context_name: &str, field_name: &str) -> MqttResult<()> {
    if value.len() > MAXIMUM_STRING_LENGTH {
        error!("{} Validation - {} string field too long", context_name, field_name);
        return Err(MqttError::new_invalid_argument(format!("{} {} is longer than {} bytes", context_name, field_name, MAXIMUM_STRING_LENGTH)));
    }

    Ok(())
}

pub(crate) fn validate_optional_string_length(optional_string: &Option<String>, context_name: &str, field_name: &str) -> MqttResult<()> {
    if let Some(value) = optional_string {
        validate_string_length(value, context_name, field_name)?;
    }

    Ok(())
}

pub(crate) fn validate_optional_binary_length(optional_data: &Option<Vec<u8>>, context_name: &str, field_name: &str) -> MqttResult<()> {
    if let Some(value) = optional_data {
        if value.len() > MAXIMUM_STRING_LENGTH {
            error!("{} Validation - {} binary field too long", context_name, field_name);
            return Err(MqttError::new_invalid_argument(format!("{} {} is longer than {} bytes", context_name, field_name, MAXIMUM_STRING_LENGTH)));
        }
    }

    Ok(())
}

pub(crate) fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_LENGTH {
        return false;
    }

    if topic.contains(['#', '+', '\0']) {
        return false;
    }

    true
}

// if the topic filter is not valid, then the other fields are not to be trusted
pub(crate) struct TopicFilterProperties {
    pub is_valid: bool,
    pub has_wildcard: bool
}

pub(crate) fn compute_topic_filter_properties(topic: &str) -> TopicFilterProperties {
    let mut properties = TopicFilterProperties {
        is_valid: true,
        has_wildcard: false
    };

    if topic.is_empty() || topic.len() > MAXIMUM_STRING_LENGTH || topic.contains('\0') {
        properties.is_valid = false;
        return properties;
    }

    let mut seen_mlw = false;
    for segment in topic.split('/') {
        if seen_mlw {
            properties.is_valid = false;
            break;
        }

        let has_wildcard = segment.contains(['#', '+']);
        properties.has_wildcard |= has_wildcard;

        if segment.len() == 1 {
            if segment == "#" {
                seen_mlw = true;
            }
        } else if has_wildcard {
            properties.is_valid = false;
            break;
        }
    }

    properties
}

pub(crate) fn is_valid_topic_filter(filter: &str) -> bool {
    compute_topic_filter_properties(filter).is_valid
}

/// One level of a parsed topic filter
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum TopicFilterLevel {
    Exact(String),
    SingleLevelWildcard,
    MultiLevelWildcard,
}

/// Splits a (previously validated) topic filter into its levels
pub(crate) fn parse_topic_filter(filter: &str) -> Vec<TopicFilterLevel> {
    filter.split('/').map(|segment| {
        match segment {
            "+" => { TopicFilterLevel::SingleLevelWildcard }
            "#" => { TopicFilterLevel::MultiLevelWildcard }
            _ => { TopicFilterLevel::Exact(segment.to_string()) }
        }
    }).collect()
}

/// Checks a concrete topic against parsed filter levels.
///
/// Topics starting with '$' are never matched by a leading wildcard.
pub(crate) fn topic_matches_filter(topic: &str, levels: &[TopicFilterLevel]) -> bool {
    if topic.starts_with('$') {
        if let Some(TopicFilterLevel::SingleLevelWildcard | TopicFilterLevel::MultiLevelWildcard) = levels.first() {
            return false;
        }
    }

    let mut topic_levels = topic.split('/');
    for level in levels {
        match level {
            TopicFilterLevel::MultiLevelWildcard => {
                return true;
            }
            TopicFilterLevel::SingleLevelWildcard => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            TopicFilterLevel::Exact(expected) => {
                match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => { return false; }
                }
            }
        }
    }

    topic_levels.next().is_none()
}
