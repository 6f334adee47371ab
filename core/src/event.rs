/*
 * event.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Varco, an intercepting HTTP/HTTPS proxy.
 *
 * Varco is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Varco is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Varco.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Structured events emitted by the core. Delivery is best-effort and sinks
//! must not block: the handler calls `emit` inline on its own task.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One observable record. Serializable so external sinks can ship events
/// as structured data.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyEvent {
    ConnectionAccepted {
        peer: String,
        at: DateTime<Utc>,
    },
    RequestComplete {
        peer: String,
        method: String,
        target: String,
        at: DateTime<Utc>,
    },
    ResponseComplete {
        peer: String,
        code: u16,
        at: DateTime<Utc>,
    },
    TlsHandshakeFailed {
        peer: String,
        host: String,
        error: String,
        at: DateTime<Utc>,
    },
    UpstreamConnectFailed {
        host: String,
        port: u16,
        error: String,
        at: DateTime<Utc>,
    },
    ConnectionTorndown {
        peer: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Event consumer. Implementations must return quickly; the core does not
/// buffer or retry on their behalf.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProxyEvent);
}

/// Discards everything. The default when no sink is configured.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ProxyEvent) {}
}

/// Writes one JSON line per event to stderr.
pub struct StderrSink;

impl EventSink for StderrSink {
    fn emit(&self, event: ProxyEvent) {
        if let Ok(json) = serde_json::to_string(&event) {
            eprintln!("[event] {}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kind_tag() {
        let e = ProxyEvent::ResponseComplete {
            peer: "127.0.0.1:9".into(),
            code: 200,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"response_complete\""));
        assert!(json.contains("\"code\":200"));
    }
}
