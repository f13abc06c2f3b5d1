// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use httpcache::network::{NetworkLayer, NetworkResponse, NetworkTransaction};
use httpcache::request::{AuthCredentials, RequestPriority};
use httpcache::{Clock, ManualClock, RequestInfo};
use httpcache_error::{Error, ErrorType, Result};
use httpcache_http::ResponseHeader;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Answers a request, with the credentials of the last auth restart if any
pub type Handler =
    dyn Fn(&RequestInfo, Option<&AuthCredentials>) -> (ResponseHeader, Vec<u8>) + Send + Sync;

/// A server in a box. The body is handed out in small reads and every network call yields, so
/// that concurrent transactions get to run in between.
pub struct MockOrigin {
    handler: Box<Handler>,
    clock: Arc<ManualClock>,
    starts: AtomicUsize,
    auth_restarts: AtomicUsize,
    requests: Mutex<Vec<RequestInfo>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub chunk_size: usize,
}

impl MockOrigin {
    pub fn new(handler: Box<Handler>, clock: Arc<ManualClock>) -> Self {
        MockOrigin {
            handler,
            clock,
            starts: AtomicUsize::new(0),
            auth_restarts: AtomicUsize::new(0),
            requests: Mutex::new(vec![]),
            gate: Mutex::new(None),
            chunk_size: 100,
        }
    }

    /// How many requests were sent, restarts not included
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn auth_restarts(&self) -> usize {
        self.auth_restarts.load(Ordering::Relaxed)
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<RequestInfo> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<RequestInfo> {
        self.requests.lock().last().cloned()
    }

    /// Hold the next request until the returned [Notify] fires
    pub fn gate_next_start(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn respond(
        &self,
        req: &RequestInfo,
        credentials: Option<&AuthCredentials>,
    ) -> (NetworkResponse, Vec<u8>) {
        let (header, body) = (self.handler)(req, credentials);
        let now = self.clock.now();
        (NetworkResponse::new(header, now, now), body)
    }
}

pub struct MockNetworkLayer {
    origin: Arc<MockOrigin>,
}

impl MockNetworkLayer {
    pub fn new(origin: Arc<MockOrigin>) -> Self {
        MockNetworkLayer { origin }
    }
}

impl NetworkLayer for MockNetworkLayer {
    fn create_transaction(&self, _priority: RequestPriority) -> Result<Box<dyn NetworkTransaction>> {
        Ok(Box::new(MockTransaction {
            origin: self.origin.clone(),
            request: None,
            response: None,
            body: vec![],
            offset: 0,
        }))
    }
}

struct MockTransaction {
    origin: Arc<MockOrigin>,
    request: Option<RequestInfo>,
    response: Option<NetworkResponse>,
    body: Vec<u8>,
    offset: usize,
}

impl MockTransaction {
    fn respond(&mut self, credentials: Option<&AuthCredentials>) -> Result<()> {
        let Some(req) = self.request.as_ref() else {
            return Error::e_explain(ErrorType::InternalError, "restart before start");
        };
        let (response, body) = self.origin.respond(req, credentials);
        self.response = Some(response);
        self.body = body;
        self.offset = 0;
        Ok(())
    }
}

#[async_trait]
impl NetworkTransaction for MockTransaction {
    async fn start(&mut self, request: &RequestInfo) -> Result<()> {
        self.origin.starts.fetch_add(1, Ordering::Relaxed);
        self.origin.requests.lock().push(request.clone());
        let gate = self.origin.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        tokio::task::yield_now().await;
        self.request = Some(request.clone());
        self.respond(None)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        tokio::task::yield_now().await;
        let n = buf
            .len()
            .min(self.origin.chunk_size)
            .min(self.body.len() - self.offset);
        buf[..n].copy_from_slice(&self.body[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<()> {
        self.origin.auth_restarts.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
        self.respond(Some(credentials))
    }

    async fn restart_ignoring_last_error(&mut self) -> Result<()> {
        tokio::task::yield_now().await;
        self.respond(None)
    }

    fn response_info(&self) -> Option<&NetworkResponse> {
        self.response.as_ref()
    }
}
