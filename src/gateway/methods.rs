//! Gateway methods exposed to the host over the bridge

use std::future::Future;
use std::sync::{Arc, Weak};

use serde_json::{Value, json};

use super::{CoreSlot, Gateway, into_error};
use crate::bridge::{MethodContext, MethodRegistry, MethodResult, methods::required_str};
use crate::channels::InboundMessage;
use crate::cron::CronJobCreate;

pub const LANES_STATUS: &str = "lanes.status";
pub const LANES_SET_CONCURRENCY: &str = "lanes.setConcurrency";
pub const BRIDGE_CLIENTS: &str = "bridge.clients";
pub const CRON_LIST: &str = "cron.list";
pub const CRON_ADD: &str = "cron.add";
pub const CRON_REMOVE: &str = "cron.remove";
pub const CRON_RUN: &str = "cron.run";
pub const AGENT_RUN: &str = "agent.run";
pub const CONFIG_RELOAD: &str = "config.reload";

/// Build the method table; handlers reach the gateway through `slot`
pub(super) fn registry(slot: &CoreSlot) -> MethodRegistry {
    let mut methods = MethodRegistry::new();

    register(&mut methods, slot, LANES_STATUS, |gateway, _| async move {
        to_value(&gateway.lane_snapshots())
    });

    register(&mut methods, slot, LANES_SET_CONCURRENCY, |gateway, ctx| async move {
        let lane = required_str(&ctx.args, "lane")?;
        let max = ctx
            .args
            .get("max")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing integer argument: max".to_string())?;
        let max = usize::try_from(max).map_err(|e| e.to_string())?;
        let snapshot = gateway
            .set_lane_concurrency(lane, max)
            .map_err(|e| e.to_string())?;
        to_value(&snapshot)
    });

    register(&mut methods, slot, BRIDGE_CLIENTS, |gateway, _| async move {
        to_value(&gateway.bridge().list_connected())
    });

    register(&mut methods, slot, CRON_LIST, |gateway, _| async move {
        to_value(&gateway.cron().list())
    });

    register(&mut methods, slot, CRON_ADD, |gateway, ctx| async move {
        let create: CronJobCreate =
            serde_json::from_value(ctx.args).map_err(|e| format!("invalid job: {e}"))?;
        let job = gateway.cron().add(create).await.map_err(|e| e.to_string())?;
        to_value(&job)
    });

    register(&mut methods, slot, CRON_REMOVE, |gateway, ctx| async move {
        let id = required_str(&ctx.args, "id")?;
        gateway.cron().remove(id).await.map_err(|e| e.to_string())?;
        Ok(json!({ "removed": true }))
    });

    register(&mut methods, slot, CRON_RUN, |gateway, ctx| async move {
        let id = required_str(&ctx.args, "id")?;
        let status = gateway.cron().run_now(id).await.map_err(|e| e.to_string())?;
        Ok(json!({ "status": status }))
    });

    register(&mut methods, slot, AGENT_RUN, |gateway, ctx| async move {
        let message: InboundMessage =
            serde_json::from_value(ctx.args).map_err(|e| format!("invalid message: {e}"))?;
        let reply = gateway
            .handle_inbound(message)
            .await
            .map_err(|e| into_error(e).to_string())?;
        to_value(&reply)
    });

    register(&mut methods, slot, CONFIG_RELOAD, |gateway, _| async move {
        gateway.reload_config().map_err(|e| e.to_string())?;
        to_value(&gateway.lane_snapshots())
    });

    methods
}

fn register<F, Fut>(methods: &mut MethodRegistry, slot: &CoreSlot, name: &str, handler: F)
where
    F: Fn(Gateway, MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    let slot = Arc::clone(slot);
    methods.register_fn(name, move |ctx| {
        let call = slot
            .get()
            .and_then(Weak::upgrade)
            .map(|core| handler(Gateway { core }, ctx));
        async move {
            match call {
                Some(call) => call.await,
                None => Err("gateway not ready".to_string()),
            }
        }
    });
}

fn to_value<T: serde::Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| e.to_string())
}
