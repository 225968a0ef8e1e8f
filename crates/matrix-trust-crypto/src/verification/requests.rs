// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{serde::Base64, OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde_json::{json, Value};

use super::{CancelCode, FlowId};
use crate::error::TransportError;

/// The verification method of the reciprocation a QR code scanner sends.
pub const RECIPROCATE_METHOD: &str = "m.reciprocate.v1";

/// The content of an outgoing verification message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingContent {
    /// We scanned the QR code of the other side, the secret proves it.
    Start {
        /// Our own device id.
        from_device: OwnedDeviceId,
        /// The method, always [`RECIPROCATE_METHOD`].
        method: String,
        /// The secret we read from the QR code.
        secret: Base64,
    },
    /// The verification finished on our side.
    Done,
    /// We cancelled the verification.
    Cancel {
        /// Why we cancelled.
        code: CancelCode,
        /// A human readable reason.
        reason: String,
    },
}

impl OutgoingContent {
    /// The event type the content should be sent as.
    pub fn event_type(&self) -> &'static str {
        match self {
            OutgoingContent::Start { .. } => "m.key.verification.start",
            OutgoingContent::Done => "m.key.verification.done",
            OutgoingContent::Cancel { .. } => "m.key.verification.cancel",
        }
    }

    /// Serialize the content, adding the flow id the way the flow type
    /// requires.
    pub fn to_json(&self, flow_id: &FlowId) -> Value {
        let mut content = match self {
            OutgoingContent::Start { from_device, method, secret } => json!({
                "from_device": from_device,
                "method": method,
                "secret": secret.encode(),
            }),
            OutgoingContent::Done => json!({}),
            OutgoingContent::Cancel { code, reason } => json!({
                "code": code.as_str(),
                "reason": reason,
            }),
        };

        match flow_id {
            FlowId::ToDevice(t) => {
                content["transaction_id"] = json!(t);
            }
            FlowId::InRoom(_, e) => {
                content["m.relates_to"] = json!({
                    "rel_type": "m.reference",
                    "event_id": e,
                });
            }
        }

        content
    }
}

/// A verification message that needs to be sent out.
#[derive(Clone, Debug)]
pub struct OutgoingVerificationRequest {
    /// A unique id for the request, used to deduplicate retries.
    pub request_id: OwnedTransactionId,
    /// The flow the message belongs to.
    pub flow_id: FlowId,
    /// The user the message is for.
    pub other_user_id: OwnedUserId,
    /// The device the message is for, if we know it.
    pub other_device_id: Option<OwnedDeviceId>,
    /// The content of the message.
    pub content: OutgoingContent,
}

impl OutgoingVerificationRequest {
    pub(crate) fn new(
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        other_device_id: Option<OwnedDeviceId>,
        content: OutgoingContent,
    ) -> Self {
        Self { request_id: TransactionId::new(), flow_id, other_user_id, other_device_id, content }
    }

    /// The event type of the message.
    pub fn event_type(&self) -> &'static str {
        self.content.event_type()
    }

    /// The JSON content of the message.
    pub fn to_json(&self) -> Value {
        self.content.to_json(&self.flow_id)
    }
}

/// The content of a received `m.key.verification.start` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartContent {
    /// The device that scanned our QR code.
    pub from_device: OwnedDeviceId,
    /// The verification method.
    pub method: String,
    /// The secret the other side read from our QR code.
    pub secret: Base64,
}

/// The content of a received `m.key.verification.cancel` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelContent {
    /// The cancel code, as sent over the wire.
    pub code: String,
    /// A human readable reason.
    pub reason: String,
}

/// A verification message we received from the other side.
#[derive(Clone, Debug)]
pub enum IncomingVerificationEvent {
    /// The other side scanned our QR code.
    Start(FlowId, StartContent),
    /// The other side finished the verification.
    Done(FlowId),
    /// The other side cancelled the verification.
    Cancel(FlowId, CancelContent),
}

impl IncomingVerificationEvent {
    /// The flow the message belongs to.
    pub fn flow_id(&self) -> &FlowId {
        match self {
            IncomingVerificationEvent::Start(f, _)
            | IncomingVerificationEvent::Done(f)
            | IncomingVerificationEvent::Cancel(f, _) => f,
        }
    }
}

/// Delivers verification messages to the other side.
#[async_trait]
pub trait VerificationTransport: Debug + Send + Sync {
    /// Send the given request.
    ///
    /// Sending the same request, with the same `request_id`, multiple times
    /// must be safe.
    async fn send(&self, request: &OutgoingVerificationRequest) -> Result<(), TransportError>;
}
