/*
 * mod.rs
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

//! Plugin contract. The hook set is fixed — request headers, request chunk,
//! response headers, response chunk, tunnel bytes, close — and plugins
//! implement the subset they care about through default methods. Instances
//! live per connection, created from registered factories at dispatch time;
//! the registry is built once at startup, nothing is discovered at runtime.
//!
//! A panicking plugin is caught at the chain boundary and skipped for the
//! rest of the connection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;

use crate::http::HttpMessage;

pub mod proxy;
pub mod web;

/// What a plugin wants done after seeing request headers.
pub enum PluginAction {
    /// Keep processing; later plugins and the protocol plugin run.
    Continue,
    /// Short-circuit with this response. Header-phase processing stops at
    /// the first plugin that answers.
    ResponseReady(HttpMessage),
    /// Drop the connection without a response.
    Close,
}

/// Per-connection plugin instance. All methods default to pass-through.
pub trait HttpPlugin: Send {
    /// Inspect or mutate request headers; may short-circuit a response.
    fn on_request_headers(&mut self, _request: &mut HttpMessage) -> PluginAction {
        PluginAction::Continue
    }

    /// Transform one decoded request body chunk. `None` drops the chunk.
    fn on_request_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
        Some(chunk)
    }

    /// Inspect or mutate response headers before they are relayed.
    fn on_response_headers(&mut self, _response: &mut HttpMessage) {}

    /// Transform one decoded response body chunk. `None` drops the chunk.
    fn on_response_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
        Some(chunk)
    }

    /// Raw bytes from the client while tunneling (CONNECT passthrough).
    fn on_client_data(&mut self, _data: &[u8]) {}

    /// Raw bytes from the origin while tunneling.
    fn on_upstream_data(&mut self, _data: &[u8]) {}

    /// Teardown notification. Called exactly once, error paths included.
    fn on_client_connection_close(&mut self) {}
}

/// Builds one plugin instance per connection.
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self) -> Box<dyn HttpPlugin>;
}

/// Startup-resolved plugin registry. Ordered lists per hook category; empty
/// lists are fine.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    /// Run for every connection, whichever protocol plugin takes it.
    pub connection: Vec<Arc<dyn PluginFactory>>,
    /// Run inside the forward-proxy plugin (e.g. authentication).
    pub proxy: Vec<Arc<dyn PluginFactory>>,
    /// Route handlers inside the web server plugin.
    pub web_routes: Vec<Arc<dyn web::WebRoute>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection_plugin(&mut self, factory: Arc<dyn PluginFactory>) -> &mut Self {
        self.connection.push(factory);
        self
    }

    pub fn add_proxy_plugin(&mut self, factory: Arc<dyn PluginFactory>) -> &mut Self {
        self.proxy.push(factory);
        self
    }

    pub fn add_web_route(&mut self, route: Arc<dyn web::WebRoute>) -> &mut Self {
        self.web_routes.push(route);
        self
    }
}

struct Slot {
    plugin: Box<dyn HttpPlugin>,
    name: String,
    dead: bool,
}

/// Ordered chain of live plugin instances for one connection. Wraps every
/// callback in panic isolation; a faulted plugin is skipped afterwards and
/// the fault is reported once through `take_fault`.
pub struct PluginChain {
    slots: Vec<Slot>,
    closed: bool,
    faulted: Option<String>,
}

impl PluginChain {
    pub fn from_factories(factories: &[Arc<dyn PluginFactory>]) -> Self {
        let slots = factories
            .iter()
            .map(|f| Slot {
                plugin: f.create(),
                name: f.name().to_string(),
                dead: false,
            })
            .collect();
        Self {
            slots,
            closed: false,
            faulted: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            closed: false,
            faulted: None,
        }
    }

    /// Append instances from more factories (e.g. the proxy sub-plugins once
    /// the proxy plugin is selected).
    pub fn extend_from(&mut self, factories: &[Arc<dyn PluginFactory>]) {
        for f in factories {
            self.slots.push(Slot {
                plugin: f.create(),
                name: f.name().to_string(),
                dead: false,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// A plugin fault since the last call, if any.
    pub fn take_fault(&mut self) -> Option<String> {
        self.faulted.take()
    }

    fn guard<T>(
        slot: &mut Slot,
        faulted: &mut Option<String>,
        f: impl FnOnce(&mut dyn HttpPlugin) -> T,
    ) -> Option<T> {
        if slot.dead {
            return None;
        }
        match catch_unwind(AssertUnwindSafe(|| f(slot.plugin.as_mut()))) {
            Ok(v) => Some(v),
            Err(_) => {
                eprintln!("[plugin] {} panicked; disabled for this connection", slot.name);
                slot.dead = true;
                *faulted = Some(slot.name.clone());
                None
            }
        }
    }

    /// Run the header hook through the chain. The first `ResponseReady` or
    /// `Close` stops the walk.
    pub fn request_headers(&mut self, request: &mut HttpMessage) -> PluginAction {
        for slot in &mut self.slots {
            match Self::guard(slot, &mut self.faulted, |p| p.on_request_headers(request)) {
                Some(PluginAction::Continue) | None => continue,
                Some(stop) => return stop,
            }
        }
        PluginAction::Continue
    }

    /// Thread a request chunk through the chain. Any plugin may drop it.
    pub fn request_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
        let mut current = chunk;
        for slot in &mut self.slots {
            match Self::guard(slot, &mut self.faulted, |p| p.on_request_chunk(current.clone())) {
                Some(Some(next)) => current = next,
                Some(None) => return None,
                None => continue,
            }
        }
        Some(current)
    }

    pub fn response_headers(&mut self, response: &mut HttpMessage) {
        for slot in &mut self.slots {
            Self::guard(slot, &mut self.faulted, |p| p.on_response_headers(response));
        }
    }

    pub fn response_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
        let mut current = chunk;
        for slot in &mut self.slots {
            match Self::guard(slot, &mut self.faulted, |p| {
                p.on_response_chunk(current.clone())
            }) {
                Some(Some(next)) => current = next,
                Some(None) => return None,
                None => continue,
            }
        }
        Some(current)
    }

    pub fn client_data(&mut self, data: &[u8]) {
        for slot in &mut self.slots {
            Self::guard(slot, &mut self.faulted, |p| p.on_client_data(data));
        }
    }

    pub fn upstream_data(&mut self, data: &[u8]) {
        for slot in &mut self.slots {
            Self::guard(slot, &mut self.faulted, |p| p.on_upstream_data(data));
        }
    }

    /// Teardown. Latched: callable from every exit path, delivered once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for slot in &mut self.slots {
            Self::guard(slot, &mut self.faulted, |p| p.on_client_connection_close());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        closes: Arc<AtomicUsize>,
    }

    impl HttpPlugin for Counting {
        fn on_client_connection_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        closes: Arc<AtomicUsize>,
    }

    impl PluginFactory for CountingFactory {
        fn name(&self) -> &str {
            "counting"
        }
        fn create(&self) -> Box<dyn HttpPlugin> {
            Box::new(Counting {
                closes: self.closes.clone(),
            })
        }
    }

    struct Panicking;

    impl HttpPlugin for Panicking {
        fn on_request_headers(&mut self, _request: &mut HttpMessage) -> PluginAction {
            panic!("plugin bug");
        }
    }

    struct PanickingFactory;

    impl PluginFactory for PanickingFactory {
        fn name(&self) -> &str {
            "panicking"
        }
        fn create(&self) -> Box<dyn HttpPlugin> {
            Box::new(Panicking)
        }
    }

    #[test]
    fn close_is_delivered_exactly_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let factories: Vec<Arc<dyn PluginFactory>> = vec![Arc::new(CountingFactory {
            closes: closes.clone(),
        })];
        let mut chain = PluginChain::from_factories(&factories);
        chain.close();
        chain.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_plugin_is_isolated_and_skipped() {
        let factories: Vec<Arc<dyn PluginFactory>> = vec![Arc::new(PanickingFactory)];
        let mut chain = PluginChain::from_factories(&factories);
        let mut req = HttpMessage::request();
        match chain.request_headers(&mut req) {
            PluginAction::Continue => {}
            _ => panic!("panic should not stop the chain"),
        }
        assert_eq!(chain.take_fault().as_deref(), Some("panicking"));
        // Dead plugin stays dead; no second fault.
        let _ = chain.request_headers(&mut req);
        assert!(chain.take_fault().is_none());
    }

    #[test]
    fn chunk_transforms_thread_through() {
        struct Upper;
        impl HttpPlugin for Upper {
            fn on_request_chunk(&mut self, chunk: Bytes) -> Option<Bytes> {
                Some(Bytes::from(chunk.to_ascii_uppercase()))
            }
        }
        struct UpperFactory;
        impl PluginFactory for UpperFactory {
            fn name(&self) -> &str {
                "upper"
            }
            fn create(&self) -> Box<dyn HttpPlugin> {
                Box::new(Upper)
            }
        }
        let factories: Vec<Arc<dyn PluginFactory>> = vec![Arc::new(UpperFactory)];
        let mut chain = PluginChain::from_factories(&factories);
        let out = chain.request_chunk(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(&out[..], b"ABC");
    }
}
