//! JSON-RPC rig daemon client (e.g. flrig's XML-RPC-flavored successor
//! daemons that speak JSON-RPC over plain HTTP POST). Polled on a fixed
//! cadence by the caller; §9 fixes that cadence at 200ms.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use super::mode_map::{generic_to_mode, mode_to_generic};
use super::{RigLink, RigReport};
use crate::error::{GatewayError, GatewayResult};
use crate::tuning::Mode;

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    message: String,
}

pub struct JsonRpcRig {
    client: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
    last_report: Mutex<Option<RigReport>>,
    /// Mirrors `LineRig`'s reconnect-forces-a-callback flag (§3 `firstPoll`).
    /// Starts `true` so the very first successful poll always reports.
    just_reconnected: AtomicBool,
}

impl JsonRpcRig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}/jsonrpc"),
            connected: AtomicBool::new(false),
            last_report: Mutex::new(None),
            just_reconnected: AtomicBool::new(true),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> GatewayResult<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                GatewayError::RigLink {
                    rig: "flrig",
                    message: e.to_string(),
                }
            })?;
        let parsed: JsonRpcResponse<T> = resp.json().await.map_err(|e| GatewayError::RigLink {
            rig: "flrig",
            message: format!("bad json-rpc response: {e}"),
        })?;
        // A false->true transition here means the previous call had dropped the
        // link; the next poll must force a callback per §3 `firstPoll`.
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.just_reconnected.store(true, Ordering::SeqCst);
        }
        if let Some(err) = parsed.error {
            return Err(GatewayError::RigLink {
                rig: "flrig",
                message: err.message,
            });
        }
        parsed.result.ok_or_else(|| GatewayError::RigLink {
            rig: "flrig",
            message: "empty json-rpc result".into(),
        })
    }
}

#[async_trait]
impl RigLink for JsonRpcRig {
    fn name(&self) -> &'static str {
        "flrig"
    }

    async fn set_frequency(&self, hz: i64) -> GatewayResult<()> {
        self.call::<serde_json::Value>("rig.set_frequency", json!({ "frequency": hz }))
            .await?;
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> GatewayResult<()> {
        self.call::<serde_json::Value>("rig.set_mode", json!({ "mode": mode_to_generic(mode) }))
            .await?;
        Ok(())
    }

    async fn set_vfo(&self, vfo: &str) -> GatewayResult<()> {
        self.call::<serde_json::Value>("rig.set_vfo", json!({ "vfo": vfo }))
            .await?;
        Ok(())
    }

    async fn poll(&self) -> GatewayResult<Option<RigReport>> {
        let frequency_hz: i64 = self
            .call("rig.get_frequency", json!({}))
            .await
            .unwrap_or(0);
        let mode_name: String = self.call("rig.get_mode", json!({})).await.unwrap_or_default();
        if frequency_hz == 0 && mode_name.is_empty() {
            return Ok(None);
        }
        let report = RigReport {
            frequency_hz,
            mode: generic_to_mode(&mode_name),
            vfo: None,
        };
        let first_poll = self.just_reconnected.swap(false, Ordering::SeqCst);
        let mut last = self.last_report.lock();
        if !first_poll && last.as_ref() == Some(&report) {
            return Ok(None);
        }
        *last = Some(report.clone());
        Ok(Some(report))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
