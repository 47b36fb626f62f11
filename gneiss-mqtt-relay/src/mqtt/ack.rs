/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::logging::impl_id_only_display;
use crate::mqtt::*;

impl_id_only_display!(PubackPacket, PubrecPacket, PubrelPacket, PubcompPacket, UnsubackPacket);
