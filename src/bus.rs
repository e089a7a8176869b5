//! Host ⇄ sub-application message channel.
//!
//! Inbound messages are accepted only from the trusted sub-application
//! origin and decoded through a fixed action table; anything else is
//! dropped. Outbound commands that need the sub-application to be listening
//! are held until its `chatReady` handshake arrives.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Messages the sub-application sends to the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SubAppMessage {
    ChatReady,
    ChatButtonIcon {
        #[serde(default, rename = "imageUrl", deserialize_with = "lenient_string")]
        image_url: String,
        #[serde(default, deserialize_with = "lenient_string")]
        svg: String,
        #[serde(default, deserialize_with = "lenient_f64")]
        radius: Option<f64>,
    },
    ChatButtonStatus {
        #[serde(default, deserialize_with = "lenient_bool")]
        visible: Option<bool>,
    },
    AutoOpenChat {
        #[serde(default, deserialize_with = "lenient_bool")]
        enabled: Option<bool>,
    },
    ChatLanguageChanged {
        #[serde(default, deserialize_with = "lenient_opt_string")]
        language: Option<String>,
    },
    UpdateChatButtonColor {
        #[serde(default, deserialize_with = "lenient_opt_string")]
        color: Option<String>,
    },
    UpdateWidgetPosition {
        #[serde(default, deserialize_with = "lenient_opt_string")]
        position: Option<String>,
    },
    CloseChatWindow,
    RequestExternalOrigin,
}

// Payload fields that are null or of the wrong type read as absent.

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(lenient_opt_string(de)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(Value::deserialize(de)?.as_str().map(str::to_string))
}

fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
    Ok(Value::deserialize(de)?.as_bool())
}

fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    Ok(Value::deserialize(de)?.as_f64())
}

impl SubAppMessage {
    /// Every action the host understands.
    pub const ACTIONS: [&'static str; 9] = [
        "chatReady",
        "chatButtonIcon",
        "chatButtonStatus",
        "autoOpenChat",
        "chatLanguageChanged",
        "updateChatButtonColor",
        "updateWidgetPosition",
        "closeChatWindow",
        "requestExternalOrigin",
    ];
}

/// Messages the host sends to the sub-application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostMessage {
    OpenChatWindow,
    ChatOpened,
    GetChatButtonIcon,
    GetChatButtonStatus,
    ExternalOrigin {
        #[serde(rename = "externalOrigin")]
        external_origin: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(SubAppMessage),
    /// Well-formed but not in the action table.
    Unknown(String),
    Malformed,
}

/// Decodes a raw message body. `ready` is accepted as a synonym for
/// `chatReady`.
pub fn decode(data: &Value) -> Decoded {
    let Some(action) = data.get("action").and_then(Value::as_str) else {
        return Decoded::Malformed;
    };
    let action = if action == "ready" { "chatReady" } else { action };
    if !SubAppMessage::ACTIONS.contains(&action) {
        return Decoded::Unknown(action.to_string());
    }
    let mut body = data.clone();
    body["action"] = Value::String(action.to_string());
    match serde_json::from_value(body) {
        Ok(message) => Decoded::Message(message),
        Err(err) => {
            debug!(%action, %err, "undecodable sub-application message");
            Decoded::Malformed
        }
    }
}

/// Delivery into the sub-application's window.
pub trait SubAppChannel: Send + Sync {
    fn post(&self, message: &HostMessage);
}

/// Channel that only logs; for headless runs with no sub-application.
#[derive(Debug, Default)]
pub struct TracingChannel;

impl SubAppChannel for TracingChannel {
    fn post(&self, message: &HostMessage) {
        info!(?message, "host -> sub-application");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Pending,
    Ready,
    /// Torn down; queued commands are dropped and nothing new is queued.
    Closed,
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<HostMessage>,
    /// A handshake deadline task is running.
    armed: bool,
    /// Pushed forward by every queued command.
    deadline: Option<Instant>,
}

pub struct MessageBus {
    trusted_origin: String,
    channel: Arc<dyn SubAppChannel>,
    handshake: watch::Sender<Handshake>,
    handshake_timeout: Duration,
    outbox: Mutex<Outbox>,
    external_origin_sent: AtomicBool,
}

impl MessageBus {
    pub fn new(
        trusted_origin: impl Into<String>,
        channel: Arc<dyn SubAppChannel>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            trusted_origin: trusted_origin.into(),
            channel,
            handshake: watch::Sender::new(Handshake::Pending),
            handshake_timeout,
            outbox: Mutex::new(Outbox::default()),
            external_origin_sent: AtomicBool::new(false),
        })
    }

    /// Origin check plus decode. Returns `None` for anything that must be
    /// ignored.
    pub fn receive(&self, origin: &str, data: &Value) -> Option<SubAppMessage> {
        if origin != self.trusted_origin {
            debug!(%origin, trusted = %self.trusted_origin, "dropping message from untrusted origin");
            return None;
        }
        match decode(data) {
            Decoded::Message(message) => Some(message),
            Decoded::Unknown(action) => {
                debug!(%action, "ignoring unknown sub-application action");
                None
            }
            Decoded::Malformed => None,
        }
    }

    pub fn handshake(&self) -> Handshake {
        *self.handshake.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.handshake() == Handshake::Ready
    }

    /// Sends immediately, regardless of handshake state.
    pub fn post(&self, message: &HostMessage) {
        debug!(?message, "posting to sub-application");
        self.channel.post(message);
    }

    /// Sends once the handshake has completed. Until then messages queue in
    /// issue order; if the handshake does not arrive within the timeout of
    /// the newest queued command the queue is dropped with a warning.
    pub fn send_when_ready(self: &Arc<Self>, message: HostMessage) {
        let arm = {
            let Ok(mut outbox) = self.outbox.lock() else {
                return;
            };
            match self.handshake() {
                Handshake::Ready => None,
                Handshake::Closed => {
                    debug!(?message, "bus closed; dropping command");
                    return;
                }
                Handshake::Pending => {
                    outbox.queue.push_back(message.clone());
                    outbox.deadline = Some(Instant::now() + self.handshake_timeout);
                    let arm = !outbox.armed;
                    outbox.armed = true;
                    Some(arm)
                }
            }
        };
        match arm {
            None => self.post(&message),
            Some(true) => {
                let bus = Arc::clone(self);
                tokio::spawn(async move { bus.await_handshake().await });
            }
            Some(false) => {}
        }
    }

    async fn await_handshake(self: Arc<Self>) {
        let mut rx = self.handshake.subscribe();
        loop {
            let Some(deadline) = self.outbox.lock().ok().and_then(|o| o.deadline) else {
                return;
            };
            let settled = async {
                rx.wait_for(|state| *state != Handshake::Pending)
                    .await
                    .map(|state| *state)
            };
            let outcome = tokio::time::timeout_at(deadline, settled).await;
            let extended = {
                let Ok(mut outbox) = self.outbox.lock() else {
                    return;
                };
                let extended = outcome.is_err()
                    && outbox.deadline.is_some_and(|d| d > Instant::now());
                if !extended {
                    match outcome {
                        Ok(Ok(Handshake::Ready)) => {}
                        Ok(_) => outbox.queue.clear(),
                        Err(_) => {
                            warn!(
                                dropped = outbox.queue.len(),
                                timeout_ms = self.handshake_timeout.as_millis() as u64,
                                "sub-application never completed its handshake; dropping queued commands"
                            );
                            outbox.queue.clear();
                        }
                    }
                    outbox.armed = false;
                    outbox.deadline = None;
                }
                extended
            };
            if !extended {
                return;
            }
        }
    }

    /// Records the handshake, asks for the authoritative launcher state and
    /// flushes queued commands in order. Repeated handshakes only refresh.
    pub fn complete_handshake(&self) {
        let queued: Vec<HostMessage> = match self.outbox.lock() {
            Ok(mut outbox) => {
                if self.handshake() == Handshake::Closed {
                    return;
                }
                self.handshake.send_replace(Handshake::Ready);
                outbox.queue.drain(..).collect()
            }
            Err(_) => return,
        };
        info!(flushed = queued.len(), "sub-application handshake complete");
        self.post(&HostMessage::GetChatButtonIcon);
        self.post(&HostMessage::GetChatButtonStatus);
        for message in &queued {
            self.post(message);
        }
    }

    /// Replies with the embedding page's origin, at most once per page life.
    pub fn reply_external_origin(&self, origin: &str) -> bool {
        if self.external_origin_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.post(&HostMessage::ExternalOrigin {
            external_origin: origin.to_string(),
        });
        true
    }

    /// Cancels any pending handshake wait and drops queued commands.
    pub fn close(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.queue.clear();
        }
        self.handshake.send_replace(Handshake::Closed);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;
    use serde_json::json;

    const TRUSTED: &str = "https://widgets.example";

    fn bus() -> (Arc<MessageBus>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let bus = MessageBus::new(TRUSTED, channel.clone(), Duration::from_secs(30));
        (bus, channel)
    }

    #[test]
    fn decodes_vocabulary() {
        assert_eq!(decode(&json!({"action": "ready"})), Decoded::Message(SubAppMessage::ChatReady));
        assert_eq!(
            decode(&json!({"action": "chatButtonIcon", "imageUrl": "https://cdn/x.png", "radius": 12})),
            Decoded::Message(SubAppMessage::ChatButtonIcon {
                image_url: "https://cdn/x.png".into(),
                svg: String::new(),
                radius: Some(12.0),
            })
        );
        assert_eq!(
            decode(&json!({"action": "chatButtonStatus"})),
            Decoded::Message(SubAppMessage::ChatButtonStatus { visible: None })
        );
        assert_eq!(
            decode(&json!({"action": "somethingNew", "x": 1})),
            Decoded::Unknown("somethingNew".into())
        );
        assert_eq!(decode(&json!({"no": "action"})), Decoded::Malformed);
    }

    #[test]
    fn null_and_mistyped_fields_read_as_absent() {
        assert_eq!(
            decode(&json!({
                "action": "chatButtonIcon",
                "imageUrl": "https://cdn.example/i.png",
                "svg": null,
                "radius": "12"
            })),
            Decoded::Message(SubAppMessage::ChatButtonIcon {
                image_url: "https://cdn.example/i.png".into(),
                svg: String::new(),
                radius: None,
            })
        );
        assert_eq!(
            decode(&json!({"action": "chatButtonStatus", "visible": "false"})),
            Decoded::Message(SubAppMessage::ChatButtonStatus { visible: None })
        );
        assert_eq!(
            decode(&json!({"action": "updateWidgetPosition", "position": 7})),
            Decoded::Message(SubAppMessage::UpdateWidgetPosition { position: None })
        );
        assert_eq!(
            decode(&json!({"action": "autoOpenChat", "enabled": null})),
            Decoded::Message(SubAppMessage::AutoOpenChat { enabled: None })
        );
    }

    #[test]
    fn host_messages_serialize_with_action_tag() {
        assert_eq!(
            serde_json::to_value(HostMessage::OpenChatWindow).unwrap(),
            json!({"action": "openChatWindow"})
        );
        assert_eq!(
            serde_json::to_value(HostMessage::ExternalOrigin {
                external_origin: "https://shop.example".into()
            })
            .unwrap(),
            json!({"action": "externalOrigin", "externalOrigin": "https://shop.example"})
        );
    }

    #[test]
    fn untrusted_origin_is_dropped() {
        let (bus, _) = bus();
        assert_eq!(bus.receive("https://evil.example", &json!({"action": "chatReady"})), None);
        assert_eq!(
            bus.receive(TRUSTED, &json!({"action": "chatReady"})),
            Some(SubAppMessage::ChatReady)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_commands_flush_in_order_after_ready() {
        let (bus, channel) = bus();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        bus.send_when_ready(HostMessage::ChatOpened);
        assert!(channel.sent().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        bus.complete_handshake();
        assert_eq!(
            channel.sent(),
            vec![
                HostMessage::GetChatButtonIcon,
                HostMessage::GetChatButtonStatus,
                HostMessage::OpenChatWindow,
                HostMessage::ChatOpened,
            ]
        );

        bus.send_when_ready(HostMessage::OpenChatWindow);
        assert_eq!(channel.count(&HostMessage::OpenChatWindow), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_drops_queue() {
        let (bus, channel) = bus();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        tokio::time::sleep(Duration::from_secs(31)).await;
        bus.complete_handshake();
        assert_eq!(
            channel.sent(),
            vec![HostMessage::GetChatButtonIcon, HostMessage::GetChatButtonStatus]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_queued_command_extends_the_deadline() {
        let (bus, channel) = bus();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        tokio::time::sleep(Duration::from_secs(29)).await;
        bus.send_when_ready(HostMessage::ChatOpened);
        tokio::time::sleep(Duration::from_secs(2)).await;
        bus.complete_handshake();
        assert_eq!(channel.count(&HostMessage::OpenChatWindow), 1);
        assert_eq!(channel.count(&HostMessage::ChatOpened), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_deadline_still_expires() {
        let (bus, channel) = bus();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        tokio::time::sleep(Duration::from_secs(20)).await;
        bus.send_when_ready(HostMessage::ChatOpened);
        tokio::time::sleep(Duration::from_secs(31)).await;
        bus.complete_handshake();
        assert_eq!(
            channel.sent(),
            vec![HostMessage::GetChatButtonIcon, HostMessage::GetChatButtonStatus]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_commands() {
        let (bus, channel) = bus();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        bus.close();
        tokio::task::yield_now().await;
        bus.complete_handshake();
        bus.send_when_ready(HostMessage::OpenChatWindow);
        assert!(channel.sent().is_empty());
        assert_eq!(bus.handshake(), Handshake::Closed);
    }

    #[test]
    fn external_origin_replied_once() {
        let (bus, channel) = bus();
        assert!(bus.reply_external_origin("https://shop.example"));
        assert!(!bus.reply_external_origin("https://shop.example"));
        assert_eq!(channel.sent().len(), 1);
    }
}
