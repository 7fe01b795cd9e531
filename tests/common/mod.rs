//! Shared fixtures for the socket-level tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use stubrig::config::GlobalSettings;
use stubrig::{MockServer, MockServerConfig};

/// Client record served by the client service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub order_history: u32,
}

impl ClientData {
    pub fn with_orders(id: u64, orders: u32) -> Self {
        Self {
            id,
            first_name: "Ivan".to_string(),
            last_name: "Ivanov".to_string(),
            date_of_birth: "1990-01-01".to_string(),
            order_history: orders,
        }
    }
}

/// Consumer under test: grants a 10% discount to clients with more than
/// five orders. Any failure to look the client up counts as zero orders.
pub struct DiscountClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscountClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn order_history(&self, client_id: u64) -> u32 {
        let url = format!("{}/client/{}", self.base_url, client_id);
        let response = match self.http.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return 0,
        };
        match response.json::<ClientData>().await {
            Ok(client) => client.order_history,
            Err(_) => 0,
        }
    }

    pub async fn discount(&self, client_id: u64) -> u32 {
        if self.order_history(client_id).await > 5 {
            10
        } else {
            0
        }
    }
}

/// Start a server with no stubs on a free local port.
pub async fn start_empty() -> MockServer {
    start_with(MockServerConfig::default()).await
}

/// Start a server from `config`, forcing a free local port.
pub async fn start_with(mut config: MockServerConfig) -> MockServer {
    config.settings = GlobalSettings {
        listen: "127.0.0.1:0".to_string(),
        ..config.settings
    };
    MockServer::start(config).await.unwrap()
}
