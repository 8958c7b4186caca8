// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Page source seam between the packet loop and the HTTP pagination client.

use std::collections::HashMap;

use async_trait::async_trait;
use packetflow_http::{PageResult, PaginationClient};

/// Something that can fetch one packet of records.
///
/// [`PaginationClient`] is the production implementation; tests substitute
/// scripted sources.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint_url: &str,
        offset: u64,
        limit: u32,
        headers: &HashMap<String, String>,
    ) -> PageResult;
}

#[async_trait]
impl PageSource for PaginationClient {
    async fn fetch_page(
        &self,
        endpoint_url: &str,
        offset: u64,
        limit: u32,
        headers: &HashMap<String, String>,
    ) -> PageResult {
        PaginationClient::fetch_page(self, endpoint_url, offset, limit, headers).await
    }
}
