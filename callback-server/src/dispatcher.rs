//! Format-agnostic RPC method dispatch.
//!
//! The [`Dispatcher`] maps one decoded call onto the [`EventListener`] and
//! decides the reply. Failures while parsing parameters or inside the
//! listener are logged and never change the reply: the gateway only ever
//! expects the fixed acknowledgement for the method it called.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use rpc_codec::{CannedResponse, RpcMessage, RpcValue};
use tracing::{debug, trace, warn};

use crate::error::DispatchError;
use crate::listener::{DatapointInfo, EventListener};

/// Multicalls may nest this many levels, counting the outermost.
pub const MAX_MULTICALL_DEPTH: usize = 2;

/// Methods reported by `system.listMethods`, in reply order.
pub const SUPPORTED_METHODS: [&str; 4] =
    ["system.multicall", "event", "deleteDevices", "newDevices"];

/// What a connection writes back for one top-level call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One of the codec's pre-built responses
    Canned(CannedResponse),
    /// A value the codec has to encode
    Value(RpcValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method<'a> {
    Event,
    NewDevices,
    DeleteDevices,
    ListDevices,
    UpdateDevice,
    ListMethods,
    Multicall,
    SetReadyConfig,
    Unknown(&'a str),
}

impl<'a> Method<'a> {
    fn parse(name: &'a str) -> Self {
        match name {
            "event" => Method::Event,
            "newDevices" => Method::NewDevices,
            "deleteDevices" => Method::DeleteDevices,
            "listDevices" => Method::ListDevices,
            "updateDevice" => Method::UpdateDevice,
            "system.listMethods" => Method::ListMethods,
            "system.multicall" => Method::Multicall,
            name if name.starts_with("setReadyConfig") => Method::SetReadyConfig,
            name => Method::Unknown(name),
        }
    }

    fn reply(self) -> Reply {
        match self {
            Method::Event => Reply::Canned(CannedResponse::EmptyString),
            Method::NewDevices
            | Method::DeleteDevices
            | Method::ListDevices
            | Method::UpdateDevice => Reply::Canned(CannedResponse::EmptyArray),
            Method::ListMethods => Reply::Value(RpcValue::List(
                SUPPORTED_METHODS.iter().map(|m| RpcValue::from(*m)).collect(),
            )),
            Method::Multicall | Method::SetReadyConfig | Method::Unknown(_) => {
                Reply::Canned(CannedResponse::EmptyEventList)
            }
        }
    }
}

/// Routes decoded calls to an [`EventListener`].
///
/// Cloning is cheap; every connection handler holds its own clone of the same
/// listener.
#[derive(Clone)]
pub struct Dispatcher {
    listener: Arc<dyn EventListener>,
}

impl Dispatcher {
    pub fn new(listener: Arc<dyn EventListener>) -> Self {
        Self { listener }
    }

    /// Dispatch one top-level call and return the reply owed to the caller.
    pub async fn dispatch(&self, message: RpcMessage) -> Reply {
        let (method_name, params) = message.into_parts();
        self.dispatch_call(method_name, params, 0).await
    }

    fn dispatch_call(
        &self,
        method_name: String,
        params: Vec<RpcValue>,
        depth: usize,
    ) -> BoxFuture<'_, Reply> {
        async move {
            let method = Method::parse(&method_name);
            debug!(method = %method_name, params = params.len(), depth, "Dispatching RPC call");

            match AssertUnwindSafe(self.invoke(method, params, depth))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(method = %method_name, depth, error = %e, "RPC call failed"),
                Err(payload) => warn!(
                    method = %method_name,
                    depth,
                    panic = panic_message(&*payload),
                    "RPC call panicked"
                ),
            }
            method.reply()
        }
        .boxed()
    }

    async fn invoke(
        &self,
        method: Method<'_>,
        params: Vec<RpcValue>,
        depth: usize,
    ) -> Result<(), DispatchError> {
        match method {
            Method::Event => {
                let (datapoint, value) = parse_event(params)?;
                trace!(%datapoint, %value, "Datapoint event");
                self.listener
                    .event_received(datapoint, value)
                    .await
                    .map_err(DispatchError::Listener)
            }
            Method::NewDevices => {
                let addresses = parse_addresses("newDevices", params)?;
                self.listener
                    .new_devices(addresses)
                    .await
                    .map_err(DispatchError::Listener)
            }
            Method::DeleteDevices => {
                let addresses = parse_addresses("deleteDevices", params)?;
                self.listener
                    .delete_devices(addresses)
                    .await
                    .map_err(DispatchError::Listener)
            }
            Method::ListDevices | Method::UpdateDevice | Method::ListMethods => Ok(()),
            Method::SetReadyConfig => {
                debug!("Gateway finished applying configuration");
                Ok(())
            }
            Method::Multicall => self.multicall(params, depth).await,
            Method::Unknown(name) => {
                warn!(method = name, "Unknown method called by gateway");
                Ok(())
            }
        }
    }

    /// Run every entry of a multicall in order. A failing entry is logged by
    /// its own dispatch and does not stop the ones after it.
    async fn multicall(&self, params: Vec<RpcValue>, depth: usize) -> Result<(), DispatchError> {
        if depth >= MAX_MULTICALL_DEPTH {
            return Err(DispatchError::MulticallTooDeep { depth: depth + 1 });
        }

        let calls = params
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::invalid("system.multicall", "missing call list"))?
            .into_list()
            .map_err(|other| {
                DispatchError::invalid(
                    "system.multicall",
                    format!("expected an array of calls, got {}", other.kind()),
                )
            })?;

        for (index, call) in calls.into_iter().enumerate() {
            match split_call(call) {
                Ok((method_name, inner)) => {
                    self.dispatch_call(method_name, inner, depth + 1).await;
                }
                Err(e) => warn!(index, error = %e, "Skipping malformed multicall entry"),
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Pull `methodName` and `params` out of one multicall entry.
fn split_call(call: RpcValue) -> Result<(String, Vec<RpcValue>), DispatchError> {
    let RpcValue::Struct(mut members) = call else {
        return Err(DispatchError::invalid(
            "system.multicall",
            format!("entry is {}, not a struct", call.kind()),
        ));
    };

    let method_name = match members.remove("methodName") {
        Some(RpcValue::String(name)) => name,
        _ => {
            return Err(DispatchError::invalid(
                "system.multicall",
                "entry has no methodName string",
            ))
        }
    };

    let params = match members.remove("params") {
        None => Vec::new(),
        Some(value) => value.into_list().map_err(|other| {
            DispatchError::invalid(
                "system.multicall",
                format!("params of {method_name} is {}, not an array", other.kind()),
            )
        })?,
    };

    Ok((method_name, params))
}

fn parse_event(params: Vec<RpcValue>) -> Result<(DatapointInfo, RpcValue), DispatchError> {
    let count = params.len();
    if count < 3 {
        return Err(DispatchError::invalid(
            "event",
            format!("expected at least 3 parameters, got {count}"),
        ));
    }

    let mut params = params.into_iter();
    let mut next = || {
        params
            .next()
            .ok_or_else(|| DispatchError::invalid("event", "parameter list ended early"))
    };

    let (address, channel) = if count == 3 {
        split_channel(&expect_string(next()?, "address")?)?
    } else {
        let first = next()?;
        match next()? {
            RpcValue::Integer(channel) => {
                let channel = u32::try_from(channel).map_err(|_| {
                    DispatchError::invalid("event", format!("negative channel {channel}"))
                })?;
                (expect_string(first, "address")?, Some(channel))
            }
            RpcValue::String(second) if second.contains(':') => split_channel(&second)?,
            RpcValue::String(second) => match second.trim().parse::<u32>() {
                Ok(channel) => (expect_string(first, "address")?, Some(channel)),
                Err(_) => (second.trim().to_string(), None),
            },
            other => {
                return Err(DispatchError::invalid(
                    "event",
                    format!("expected address or channel, got {}", other.kind()),
                ))
            }
        }
    };

    let parameter = expect_string(next()?, "parameter name")?;
    let value = next()?;

    Ok((DatapointInfo::new(address, channel, parameter), value))
}

fn expect_string(value: RpcValue, what: &str) -> Result<String, DispatchError> {
    match value {
        RpcValue::String(s) => Ok(s.trim().to_string()),
        other => Err(DispatchError::invalid(
            "event",
            format!("{what} must be a string, got {}", other.kind()),
        )),
    }
}

/// Split `ADDR:CH` into address and channel. A bare address has no channel.
fn split_channel(address: &str) -> Result<(String, Option<u32>), DispatchError> {
    let address = address.trim();
    match address.split_once(':') {
        None => Ok((address.to_string(), None)),
        Some((device, channel)) => {
            let channel = channel.parse::<u32>().map_err(|_| {
                DispatchError::invalid("event", format!("invalid channel in {address:?}"))
            })?;
            Ok((device.to_string(), Some(channel)))
        }
    }
}

/// Extract device addresses from the first list parameter, dropping channel
/// suffixes and repeats.
fn parse_addresses(
    method: &'static str,
    params: Vec<RpcValue>,
) -> Result<Vec<String>, DispatchError> {
    let entries = params
        .into_iter()
        .find_map(|param| param.into_list().ok())
        .ok_or_else(|| DispatchError::invalid(method, "no device list parameter"))?;

    let mut addresses = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = match entry {
            RpcValue::String(address) => address,
            RpcValue::Struct(members) => address_member(method, members)?,
            other => {
                return Err(DispatchError::invalid(
                    method,
                    format!("unexpected {} in device list", other.kind()),
                ))
            }
        };

        let device = raw.split_once(':').map_or(raw.as_str(), |(device, _)| device).trim();
        if !device.is_empty() && !addresses.iter().any(|known| known == device) {
            addresses.push(device.to_string());
        }
    }
    Ok(addresses)
}

fn address_member(
    method: &'static str,
    mut members: BTreeMap<String, RpcValue>,
) -> Result<String, DispatchError> {
    match members.remove("ADDRESS") {
        Some(RpcValue::String(address)) => Ok(address),
        _ => Err(DispatchError::invalid(
            method,
            "device description without ADDRESS",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{GatewayEvent, ListenerError};
    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::sync::Mutex;

    /// Records every callback; fails the ones whose first address is `FAIL`
    /// and panics on `PANIC` without recording.
    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<GatewayEvent>>,
    }

    impl RecordingListener {
        async fn events(&self) -> Vec<GatewayEvent> {
            self.events.lock().await.clone()
        }

        async fn record(&self, event: GatewayEvent) -> Result<(), ListenerError> {
            let marker = match &event {
                GatewayEvent::Datapoint { datapoint, .. } => Some(datapoint.address.as_str()),
                GatewayEvent::NewDevices(a) | GatewayEvent::DeleteDevices(a) => {
                    a.first().map(String::as_str)
                }
            };
            if marker == Some("PANIC") {
                panic!("listener blew up");
            }
            let fail = marker == Some("FAIL");
            self.events.lock().await.push(event);
            if fail {
                Err("listener rejected the event".into())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        async fn event_received(
            &self,
            datapoint: DatapointInfo,
            value: RpcValue,
        ) -> Result<(), ListenerError> {
            self.record(GatewayEvent::Datapoint { datapoint, value }).await
        }

        async fn new_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError> {
            self.record(GatewayEvent::NewDevices(addresses)).await
        }

        async fn delete_devices(&self, addresses: Vec<String>) -> Result<(), ListenerError> {
            self.record(GatewayEvent::DeleteDevices(addresses)).await
        }
    }

    fn setup() -> (Arc<RecordingListener>, Dispatcher) {
        let listener = Arc::new(RecordingListener::default());
        let dispatcher = Dispatcher::new(listener.clone());
        (listener, dispatcher)
    }

    fn strings(items: &[&str]) -> RpcValue {
        RpcValue::List(items.iter().map(|s| RpcValue::from(*s)).collect())
    }

    fn call(method: &str, params: Vec<RpcValue>) -> RpcValue {
        RpcValue::structure([
            ("methodName", RpcValue::from(method)),
            ("params", RpcValue::List(params)),
        ])
    }

    fn datapoint(address: &str, channel: Option<u32>, parameter: &str, value: RpcValue) -> GatewayEvent {
        GatewayEvent::Datapoint {
            datapoint: DatapointInfo::new(address, channel, parameter),
            value,
        }
    }

    #[rstest]
    #[case::interface_and_channel_address(
        vec!["BidCos-RF".into(), "LEQ0123456:1".into(), "STATE".into(), true.into()],
        datapoint("LEQ0123456", Some(1), "STATE", RpcValue::Bool(true))
    )]
    #[case::interface_and_device_address(
        vec!["BidCos-RF".into(), "LEQ0123456".into(), "UNREACH".into(), false.into()],
        datapoint("LEQ0123456", None, "UNREACH", RpcValue::Bool(false))
    )]
    #[case::numeric_string_channel(
        vec!["LEQ0123456".into(), "1".into(), "STATE".into(), true.into()],
        datapoint("LEQ0123456", Some(1), "STATE", RpcValue::Bool(true))
    )]
    #[case::integer_channel(
        vec!["LEQ0123456".into(), RpcValue::Integer(2), "LEVEL".into(), 0.5.into()],
        datapoint("LEQ0123456", Some(2), "LEVEL", RpcValue::Double(0.5))
    )]
    #[case::three_params(
        vec!["LEQ0123456:3".into(), "TEMPERATURE".into(), 21.5.into()],
        datapoint("LEQ0123456", Some(3), "TEMPERATURE", RpcValue::Double(21.5))
    )]
    #[tokio::test]
    async fn test_event_layouts(#[case] params: Vec<RpcValue>, #[case] expected: GatewayEvent) {
        let (listener, dispatcher) = setup();

        let reply = dispatcher.dispatch(RpcMessage::new("event", params)).await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyString));
        assert_eq!(listener.events().await, vec![expected]);
    }

    #[rstest]
    #[case::too_few(vec!["LEQ0123456:1".into(), "STATE".into()])]
    #[case::integer_address(vec![RpcValue::Integer(1), "STATE".into(), true.into()])]
    #[case::bad_channel(vec!["LEQ0123456:x".into(), "STATE".into(), true.into()])]
    #[case::negative_channel(
        vec!["LEQ0123456".into(), RpcValue::Integer(-1), "STATE".into(), true.into()]
    )]
    #[tokio::test]
    async fn test_invalid_event_still_gets_reply(#[case] params: Vec<RpcValue>) {
        let (listener, dispatcher) = setup();

        let reply = dispatcher.dispatch(RpcMessage::new("event", params)).await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyString));
        assert!(listener.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_listener_failure_does_not_change_reply() {
        let (listener, dispatcher) = setup();
        let params = vec!["FAIL:1".into(), "STATE".into(), true.into()];

        let reply = dispatcher.dispatch(RpcMessage::new("event", params)).await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyString));
        assert_eq!(listener.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_devices_strips_channels_and_dedups() {
        let (listener, dispatcher) = setup();
        let descriptions = RpcValue::List(vec![
            RpcValue::structure([("ADDRESS", "LEQ0123456".into())]),
            RpcValue::structure([("ADDRESS", "LEQ0123456:0".into()), ("TYPE", "MAINTENANCE".into())]),
            RpcValue::structure([("ADDRESS", "LEQ0123456:1".into())]),
            RpcValue::structure([("ADDRESS", "MEQ0000001:1".into())]),
        ]);

        let reply = dispatcher
            .dispatch(RpcMessage::new("newDevices", vec!["BidCos-RF".into(), descriptions]))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyArray));
        assert_eq!(
            listener.events().await,
            vec![GatewayEvent::NewDevices(vec![
                "LEQ0123456".to_string(),
                "MEQ0000001".to_string()
            ])]
        );
    }

    #[tokio::test]
    async fn test_delete_devices_accepts_flat_list() {
        let (listener, dispatcher) = setup();

        let reply = dispatcher
            .dispatch(RpcMessage::new(
                "deleteDevices",
                vec!["BidCos-RF".into(), strings(&["LEQ0123456", "LEQ0123456:1"])],
            ))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyArray));
        assert_eq!(
            listener.events().await,
            vec![GatewayEvent::DeleteDevices(vec!["LEQ0123456".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_list_methods() {
        let (listener, dispatcher) = setup();

        let reply = dispatcher
            .dispatch(RpcMessage::new("system.listMethods", vec![]))
            .await;

        assert_eq!(
            reply,
            Reply::Value(strings(&["system.multicall", "event", "deleteDevices", "newDevices"]))
        );
        assert!(listener.events().await.is_empty());
    }

    #[rstest]
    #[case::list_devices("listDevices", Reply::Canned(CannedResponse::EmptyArray))]
    #[case::update_device("updateDevice", Reply::Canned(CannedResponse::EmptyArray))]
    #[case::ready_config("setReadyConfig", Reply::Canned(CannedResponse::EmptyEventList))]
    #[case::unknown("reportValueUsage", Reply::Canned(CannedResponse::EmptyEventList))]
    #[tokio::test]
    async fn test_methods_without_listener_calls(#[case] method: &str, #[case] expected: Reply) {
        let (listener, dispatcher) = setup();

        let reply = dispatcher
            .dispatch(RpcMessage::new(method, vec!["BidCos-RF".into()]))
            .await;

        assert_eq!(reply, expected);
        assert!(listener.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_multicall_runs_entries_in_order() {
        let (listener, dispatcher) = setup();
        let calls = RpcValue::List(vec![
            call("newDevices", vec![strings(&["A"])]),
            call("deleteDevices", vec![strings(&["B"])]),
        ]);

        let reply = dispatcher
            .dispatch(RpcMessage::new("system.multicall", vec![calls]))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyEventList));
        assert_eq!(
            listener.events().await,
            vec![
                GatewayEvent::NewDevices(vec!["A".to_string()]),
                GatewayEvent::DeleteDevices(vec!["B".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_multicall_isolates_failing_entries() {
        let (listener, dispatcher) = setup();
        let calls = RpcValue::List(vec![
            call("event", vec!["too-few".into()]),
            RpcValue::from("not a call"),
            call("newDevices", vec![strings(&["FAIL"])]),
            call("event", vec!["BidCos-RF".into(), "LEQ0123456:1".into(), "STATE".into(), true.into()]),
        ]);

        let reply = dispatcher
            .dispatch(RpcMessage::new("system.multicall", vec![calls]))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyEventList));
        assert_eq!(
            listener.events().await,
            vec![
                GatewayEvent::NewDevices(vec!["FAIL".to_string()]),
                datapoint("LEQ0123456", Some(1), "STATE", RpcValue::Bool(true)),
            ]
        );
    }

    #[tokio::test]
    async fn test_multicall_survives_panicking_listener() {
        let (listener, dispatcher) = setup();
        let calls = RpcValue::List(vec![
            call("newDevices", vec![strings(&["PANIC"])]),
            call("newDevices", vec![strings(&["AFTER"])]),
        ]);

        let reply = dispatcher
            .dispatch(RpcMessage::new("system.multicall", vec![calls]))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyEventList));
        assert_eq!(
            listener.events().await,
            vec![GatewayEvent::NewDevices(vec!["AFTER".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_panicking_event_still_gets_reply() {
        let (listener, dispatcher) = setup();
        let params = vec!["PANIC:1".into(), "STATE".into(), true.into()];

        let reply = dispatcher.dispatch(RpcMessage::new("event", params)).await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyString));
        assert!(listener.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_multicall_nesting_is_bounded() {
        let (listener, dispatcher) = setup();
        let event = |address: &str| {
            call("event", vec![format!("{address}:1").into(), "STATE".into(), true.into()])
        };
        let innermost = call("system.multicall", vec![RpcValue::List(vec![event("DEEP")])]);
        let nested = call(
            "system.multicall",
            vec![RpcValue::List(vec![event("NESTED"), innermost])],
        );

        let reply = dispatcher
            .dispatch(RpcMessage::new(
                "system.multicall",
                vec![RpcValue::List(vec![event("OUTER"), nested])],
            ))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyEventList));
        assert_eq!(
            listener.events().await,
            vec![
                datapoint("OUTER", Some(1), "STATE", RpcValue::Bool(true)),
                datapoint("NESTED", Some(1), "STATE", RpcValue::Bool(true)),
            ]
        );
    }

    #[tokio::test]
    async fn test_multicall_without_call_list() {
        let (listener, dispatcher) = setup();

        let reply = dispatcher
            .dispatch(RpcMessage::new("system.multicall", vec![RpcValue::Integer(1)]))
            .await;

        assert_eq!(reply, Reply::Canned(CannedResponse::EmptyEventList));
        assert!(listener.events().await.is_empty());
    }
}
