// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Topic bridging between the internal bus and an external peer.
//!
//! Inbound frames are JSON envelopes `{topic, payload}`; each topic is
//! checked against an allow-list before being re-published internally, so
//! an untrusted peer cannot inject arbitrary topics. Outbound frames are
//! filtered symmetrically, wrapped in a versioned envelope and fragmented
//! to the link's payload budget.

use serde::{Deserialize, Serialize};

use crate::bus::Payload;

use super::link::{LinkError, LinkResult};

/// Topic filter: `*` matches everything, `prefix/*` matches by prefix,
/// anything else matches exactly.
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<String>,
}

impl AllowList {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn allows(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        self.patterns.iter().any(|pat| {
            if pat == "*" {
                true
            } else if let Some(prefix) = pat.strip_suffix("/*") {
                topic
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
            } else {
                pat == topic
            }
        })
    }
}

/// Inbound envelope written by the peer.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: Payload,
}

impl InboundFrame {
    pub fn parse(raw: &[u8]) -> LinkResult<Self> {
        let frame: Self =
            serde_json::from_slice(raw).map_err(|e| LinkError(format!("bad frame: {e}")))?;
        if frame.topic.trim().is_empty() {
            return Err(LinkError::new("bad frame: empty topic"));
        }
        Ok(frame)
    }
}

/// Outbound envelope sent to the peer.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub v: u32,
    pub seq: u32,
    pub topic: String,
    pub ts: u64,
    pub ttl_ms: u64,
    pub payload: Payload,
}

impl OutboundFrame {
    pub fn new(seq: u32, topic: impl Into<String>, ts: u64, payload: Payload) -> Self {
        Self {
            v: 1,
            seq,
            topic: topic.into(),
            ts,
            ttl_ms: 0,
            payload,
        }
    }

    /// Serialize and split into fragments of at most `max_payload` bytes.
    pub fn fragments(&self, max_payload: usize) -> LinkResult<Vec<Vec<u8>>> {
        let data = serde_json::to_vec(self).map_err(|e| LinkError(format!("encode: {e}")))?;
        let max = max_payload.max(1);
        Ok(data.chunks(max).map(|c| c.to_vec()).collect())
    }
}

/// Usable payload bytes for a given MTU, clamped to the protocol budget.
pub fn max_payload_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(3).clamp(20, 180)
}
