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

//! The network side of a cache transaction

use super::*;
use crate::request::{AuthCredentials, RequestInfo, RequestPriority};
use crate::response::ResponseInfo;

use async_trait::async_trait;
use std::time::SystemTime;

/// The response headers a [NetworkTransaction] received
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub header: ResponseHeader,
    /// When the request was sent
    pub request_time: SystemTime,
    /// When the response headers arrived
    pub response_time: SystemTime,
}

impl NetworkResponse {
    pub fn new(header: ResponseHeader, request_time: SystemTime, response_time: SystemTime) -> Self {
        NetworkResponse {
            header,
            request_time,
            response_time,
        }
    }
}

/// One HTTP exchange with the server.
///
/// A 401 or 407 is a successful [Self::start()]: the caller decides whether to restart with
/// credentials.
#[async_trait]
pub trait NetworkTransaction: Send {
    /// Send the request and wait for the response headers
    async fn start(&mut self, request: &RequestInfo) -> Result<()>;

    /// Read body bytes. 0 means the body is done.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Resend the request with the given credentials
    async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<()>;

    /// Resend the request after a certificate error the caller chose to ignore
    async fn restart_ignoring_last_error(&mut self) -> Result<()>;

    /// The response headers, once [Self::start()] succeeded
    fn response_info(&self) -> Option<&NetworkResponse>;

    fn set_priority(&mut self, _priority: RequestPriority) {}

    /// Whether the transaction can restart by itself, e.g. it already has the credentials
    fn is_ready_to_restart_for_auth(&self) -> bool {
        false
    }
}

/// Creates [NetworkTransaction]s
pub trait NetworkLayer: Send + Sync {
    fn create_transaction(&self, priority: RequestPriority) -> Result<Box<dyn NetworkTransaction>>;
}

/// Called before a stored response is handed out.
///
/// Fail with [ErrorType::CachedIpAddressSpaceBlocked] to make the transaction go to the network
/// instead, or with [ErrorType::InconsistentIpAddressSpace] to fail it. Either way the entry is
/// doomed.
pub trait ConnectedHook: Send + Sync {
    fn on_connected(&self, url: &str, response: &ResponseInfo) -> Result<()>;
}
