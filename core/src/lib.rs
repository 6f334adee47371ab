/*
 * lib.rs
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

//! Varco core: an intercepting HTTP/HTTPS forward proxy and embedded web
//! server in one process. Front-ends construct a [`config::ProxyConfig`] and
//! a [`plugin::PluginRegistry`], then bind and run a
//! [`server::ProxyServer`]; everything per-connection — incremental HTTP
//! parsing, plugin dispatch, CONNECT tunnels, TLS interception — happens in
//! the protocol handler each accepted socket is owned by.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod http;
pub mod net;
pub mod plugin;
pub mod server;
pub mod tls;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use event::{EventSink, NoopSink, ProxyEvent, StderrSink};
pub use plugin::{HttpPlugin, PluginAction, PluginChain, PluginFactory, PluginRegistry};
pub use server::{ProxyServer, ShutdownHandle};
