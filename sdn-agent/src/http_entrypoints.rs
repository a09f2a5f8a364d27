// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent's local RPC surface.
//!
//! Imperative flow operations act on the `THEMAN` producer of the named
//! bridge; the rest are thin passthroughs to ovs-vsctl and the forward
//! registry. Every call answers `{code, mesg}` with code 0 on success,
//! so a scripted caller only ever looks at one field.

use crate::agent::Agent;
use crate::flow_man::Error as FlowManError;
use crate::forwarder::ForwardKey;
use crate::md_man::MdMan;
use crate::port_cache;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk, RequestContext, TypedBody,
};
use ovs_utils::flow::{Flow, Match};
use ovs_utils::vsctl::Vsctl;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct ServerContext {
    pub agent: Arc<Agent>,
    pub md_man: Arc<MdMan>,
}

type AgentApiDescription = ApiDescription<Arc<ServerContext>>;

pub fn api() -> AgentApiDescription {
    fn register_endpoints(api: &mut AgentApiDescription) -> Result<(), String> {
        api.register(add_flow)?;
        api.register(del_flow)?;
        api.register(sync_flows)?;
        api.register(dump_bridge_port)?;
        api.register(add_bridge)?;
        api.register(del_bridge)?;
        api.register(add_bridge_port)?;
        api.register(del_bridge_port)?;
        api.register(open_forward)?;
        api.register(close_forward)?;
        Ok(())
    }

    let mut api = AgentApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct FlowSpec {
    pub bridge: String,
    pub table: u8,
    pub priority: u16,
    /// Match predicates in `ovs-ofctl` textual form, e.g. `tcp` or
    /// `nw_dst=10.0.0.1`.
    #[serde(default)]
    pub matches: Vec<String>,
    pub actions: String,
    #[serde(default)]
    pub cookie: u64,
}

impl FlowSpec {
    fn to_flow(&self) -> Flow {
        let matches = self.matches.iter().map(|m| Match::flag(m.as_str())).collect();
        Flow::new(self.table, self.priority, matches, self.actions.as_str())
            .with_cookie(self.cookie)
    }
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct BridgeParam {
    pub bridge: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct BridgePortParam {
    pub bridge: String,
    pub port: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ForwardParam {
    pub proto: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub net_id: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
}

/// The uniform RPC answer: `code` 0 means success.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct AgentResponse {
    pub code: i32,
    pub mesg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_no: Option<u32>,
}

impl AgentResponse {
    fn ok() -> HttpResponseOk<AgentResponse> {
        HttpResponseOk(AgentResponse { code: 0, mesg: "ok".to_string(), port_no: None })
    }

    fn ok_port(port_no: u32) -> HttpResponseOk<AgentResponse> {
        HttpResponseOk(AgentResponse {
            code: 0,
            mesg: "ok".to_string(),
            port_no: Some(port_no),
        })
    }

    fn fail<E: std::fmt::Display>(err: E) -> HttpResponseOk<AgentResponse> {
        HttpResponseOk(AgentResponse { code: 1, mesg: err.to_string(), port_no: None })
    }

    fn from_result<E: std::fmt::Display>(
        result: Result<(), E>,
    ) -> HttpResponseOk<AgentResponse> {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::fail(err),
        }
    }
}

/// Install a flow on a bridge under the imperative producer.
#[endpoint {
    method = POST,
    path = "/add-flow",
}]
async fn add_flow(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<FlowSpec>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let spec = body.into_inner();
    let flow_man = rqctx.context().agent.get_flow_man(&spec.bridge);
    let result: Result<(), FlowManError> = flow_man.add_flow(spec.to_flow()).await;
    Ok(AgentResponse::from_result(result))
}

/// Remove a flow from the imperative producer.
#[endpoint {
    method = POST,
    path = "/del-flow",
}]
async fn del_flow(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<FlowSpec>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let spec = body.into_inner();
    let flow_man = rqctx.context().agent.get_flow_man(&spec.bridge);
    Ok(AgentResponse::from_result(flow_man.del_flow(spec.to_flow()).await))
}

/// Force one reconciliation of the bridge, waiting for it to finish.
#[endpoint {
    method = POST,
    path = "/sync-flows",
}]
async fn sync_flows(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgeParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    let flow_man = rqctx.context().agent.get_flow_man(&param.bridge);
    Ok(AgentResponse::from_result(flow_man.sync_flows().await))
}

/// The OpenFlow port number of a named port.
#[endpoint {
    method = POST,
    path = "/dump-bridge-port",
}]
async fn dump_bridge_port(
    _rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgePortParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    let response = match port_cache::dump_port(&param.bridge, &param.port).await {
        Ok(Some(port_no)) => AgentResponse::ok_port(port_no),
        Ok(None) => AgentResponse::fail(format!(
            "port {} not found on {}",
            param.port, param.bridge
        )),
        Err(err) => AgentResponse::fail(err),
    };
    Ok(response)
}

#[endpoint {
    method = POST,
    path = "/add-bridge",
}]
async fn add_bridge(
    _rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgeParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    Ok(AgentResponse::from_result(Vsctl::add_bridge(&param.bridge).await))
}

#[endpoint {
    method = POST,
    path = "/del-bridge",
}]
async fn del_bridge(
    _rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgeParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    Ok(AgentResponse::from_result(Vsctl::del_bridge(&param.bridge).await))
}

#[endpoint {
    method = POST,
    path = "/add-bridge-port",
}]
async fn add_bridge_port(
    _rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgePortParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    Ok(AgentResponse::from_result(Vsctl::add_port(&param.bridge, &param.port).await))
}

#[endpoint {
    method = POST,
    path = "/del-bridge-port",
}]
async fn del_bridge_port(
    _rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<BridgePortParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    let result = Vsctl::del_port(&param.bridge, &param.port).await;
    port_cache::invalidate(&param.bridge, &param.port);
    Ok(AgentResponse::from_result(result))
}

/// Open a TCP forward inside a subnet's metadata namespace. Answers
/// with the actually-bound port, which matters when bind_port is 0.
#[endpoint {
    method = POST,
    path = "/open-forward",
}]
async fn open_forward(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<ForwardParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    if param.proto != "tcp" {
        return Ok(AgentResponse::fail(format!("unsupported proto {:?}", param.proto)));
    }
    let key = ForwardKey {
        proto: param.proto,
        bind_addr: param.bind_addr,
        bind_port: param.bind_port,
    };
    let response = match rqctx
        .context()
        .md_man
        .open_forward(&param.net_id, key, &param.remote_addr, param.remote_port)
        .await
    {
        Ok(bound_port) => AgentResponse::ok_port(bound_port as u32),
        Err(err) => AgentResponse::fail(err),
    };
    Ok(response)
}

#[endpoint {
    method = POST,
    path = "/close-forward",
}]
async fn close_forward(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<ForwardParam>,
) -> Result<HttpResponseOk<AgentResponse>, HttpError> {
    let param = body.into_inner();
    let key = ForwardKey {
        proto: param.proto,
        bind_addr: param.bind_addr,
        bind_port: param.bind_port,
    };
    Ok(AgentResponse::from_result(
        rqctx.context().md_man.close_forward(&param.net_id, &key).await,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flow_spec_to_flow() {
        let spec = FlowSpec {
            bridge: "br0".to_string(),
            table: 0,
            priority: 100,
            matches: vec!["nw_dst=10.0.0.1".to_string(), "tcp".to_string()],
            actions: "drop".to_string(),
            cookie: 0xbeef,
        };
        let flow = spec.to_flow();
        assert_eq!(flow.cookie, 0xbeef);
        // Canonicalized on construction.
        assert_eq!(
            flow.matches().iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            vec!["nw_dst=10.0.0.1", "tcp"],
        );
    }
}
