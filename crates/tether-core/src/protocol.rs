//! Inbound service message dispatch.
//!
//! The transport delivers every packet it does not consume itself as an
//! [`InboundMessage`]: a type discriminator plus a JSON body. The
//! [`ProtocolMessageHandler`] records when traffic was last seen and decodes
//! the handful of message types the controller cares about into
//! [`ProtocolEvent`]s.
//!
//! ```text
//! ClientItemAnnouncements              → UserNotifications { Items: n }
//! ClientPlayingSessionState            → PlayingSessionState
//! ClientPurchaseResponse               → PurchaseResponse
//! ClientRedeemGuestPassResponse        → RedeemGuestPassResponse
//! ClientSharedLibraryLockStatus        → SharedLibraryLockStatus
//! ClientUserNotifications              → UserNotifications
//! ClientVanityURLChangedNotification   → VanityUrlChanged
//! anything else                        → ignored
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::model::AccountId;

// =============================================================================
// Wire Shapes
// =============================================================================

/// An undecoded service message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub msg_type: String,
    #[serde(default)]
    pub body: Value,
}

impl InboundMessage {
    pub fn new(msg_type: impl Into<String>, body: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
        }
    }
}

#[derive(Deserialize)]
struct ItemAnnouncementsBody {
    #[serde(default)]
    count_new_items: u32,
}

#[derive(Deserialize)]
struct PlayingSessionStateBody {
    #[serde(default)]
    playing_blocked: bool,
}

#[derive(Deserialize)]
struct PurchaseResponseBody {
    eresult: i32,
    #[serde(default)]
    purchase_result_details: i32,
    #[serde(default)]
    line_items: Option<Vec<LineItem>>,
}

#[derive(Deserialize)]
struct LineItem {
    #[serde(default)]
    package_id: u32,
    #[serde(default)]
    item_app_id: u32,
    #[serde(default)]
    item_description: String,
}

#[derive(Deserialize)]
struct RedeemGuestPassResponseBody {
    eresult: i32,
}

#[derive(Deserialize)]
struct SharedLibraryLockStatusBody {
    #[serde(default)]
    own_library_locked_by: u64,
}

#[derive(Deserialize)]
struct UserNotificationsBody {
    #[serde(default)]
    notifications: Option<Vec<NotificationEntry>>,
}

#[derive(Deserialize)]
struct NotificationEntry {
    user_notification_type: u8,
    count: u32,
}

#[derive(Deserialize)]
struct VanityUrlChangedBody {
    #[serde(default)]
    vanity_url: Option<String>,
}

// =============================================================================
// Events
// =============================================================================

/// Notification counters the service pushes to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationKind {
    Trading,
    GameTurns,
    ModeratorMessages,
    Comments,
    Items,
    Invites,
    Gifts,
    Chat,
    HelpRequestReplies,
    AccountAlerts,
}

impl NotificationKind {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Trading,
            2 => Self::GameTurns,
            3 => Self::ModeratorMessages,
            4 => Self::Comments,
            5 => Self::Items,
            6 => Self::Invites,
            8 => Self::Gifts,
            9 => Self::Chat,
            10 => Self::HelpRequestReplies,
            11 => Self::AccountAlerts,
            _ => return None,
        })
    }
}

/// Typed event decoded from an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    UserNotifications {
        notifications: BTreeMap<NotificationKind, u32>,
    },
    PlayingSessionState {
        playing_blocked: bool,
    },
    PurchaseResponse {
        result: i32,
        result_detail: i32,
        /// Package (or app, for coupons) id to item name.
        items: BTreeMap<u32, String>,
    },
    RedeemGuestPassResponse {
        result: i32,
    },
    SharedLibraryLockStatus {
        locked_by: Option<AccountId>,
    },
    VanityUrlChanged {
        vanity_url: Option<String>,
    },
}

// =============================================================================
// Handler
// =============================================================================

/// Decodes inbound messages and tracks when traffic was last observed.
#[derive(Debug)]
pub struct ProtocolMessageHandler {
    last_packet_received: Mutex<Instant>,
}

impl Default for ProtocolMessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolMessageHandler {
    pub fn new() -> Self {
        Self {
            last_packet_received: Mutex::new(Instant::now()),
        }
    }

    /// When the last inbound message was seen.
    pub fn last_packet_received(&self) -> Instant {
        *self.last_packet_received.lock()
    }

    /// Records inbound traffic that carries no decodable message.
    pub fn record_traffic(&self) {
        *self.last_packet_received.lock() = Instant::now();
    }

    /// Records inbound traffic and decodes `message`.
    ///
    /// Returns `None` for message types without a case here and for bodies
    /// that fail to decode.
    pub fn handle(&self, message: &InboundMessage) -> Option<ProtocolEvent> {
        self.record_traffic();

        macro_rules! decode {
            ($ty:ty) => {
                match serde_json::from_value::<$ty>(message.body.clone()) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(msg_type = %message.msg_type, error = %e, "Failed to decode message");
                        return None;
                    }
                }
            };
        }

        let event = match message.msg_type.as_str() {
            "ClientItemAnnouncements" => {
                let body = decode!(ItemAnnouncementsBody);
                ProtocolEvent::UserNotifications {
                    notifications: BTreeMap::from([(NotificationKind::Items, body.count_new_items)]),
                }
            }
            "ClientPlayingSessionState" => {
                let body = decode!(PlayingSessionStateBody);
                ProtocolEvent::PlayingSessionState {
                    playing_blocked: body.playing_blocked,
                }
            }
            "ClientPurchaseResponse" => {
                let body = decode!(PurchaseResponseBody);
                ProtocolEvent::PurchaseResponse {
                    result: body.eresult,
                    result_detail: body.purchase_result_details,
                    items: purchased_items(body.line_items.unwrap_or_default()),
                }
            }
            "ClientRedeemGuestPassResponse" => {
                let body = decode!(RedeemGuestPassResponseBody);
                ProtocolEvent::RedeemGuestPassResponse {
                    result: body.eresult,
                }
            }
            "ClientSharedLibraryLockStatus" => {
                let body = decode!(SharedLibraryLockStatusBody);
                ProtocolEvent::SharedLibraryLockStatus {
                    locked_by: (body.own_library_locked_by != 0)
                        .then_some(AccountId(body.own_library_locked_by)),
                }
            }
            "ClientUserNotifications" => {
                let body = decode!(UserNotificationsBody);
                ProtocolEvent::UserNotifications {
                    notifications: notification_counts(body.notifications.unwrap_or_default()),
                }
            }
            "ClientVanityURLChangedNotification" => {
                let body = decode!(VanityUrlChangedBody);
                ProtocolEvent::VanityUrlChanged {
                    vanity_url: body.vanity_url.filter(|url| !url.is_empty()),
                }
            }
            other => {
                trace!(msg_type = other, "Ignoring unhandled message");
                return None;
            }
        };

        Some(event)
    }
}

/// A missing list means no trading notifications, so `Trading` is always present.
fn notification_counts(entries: Vec<NotificationEntry>) -> BTreeMap<NotificationKind, u32> {
    let mut notifications = BTreeMap::from([(NotificationKind::Trading, 0)]);
    for entry in entries {
        match NotificationKind::from_code(entry.user_notification_type) {
            Some(kind) => {
                notifications.insert(kind, entry.count);
            }
            None => warn!(
                notification_type = entry.user_notification_type,
                "Unknown notification type"
            ),
        }
    }
    notifications
}

/// Coupons carry no package id; their app id is used instead.
fn purchased_items(line_items: Vec<LineItem>) -> BTreeMap<u32, String> {
    let mut items = BTreeMap::new();
    for item in line_items {
        let id = if item.package_id != 0 {
            item.package_id
        } else {
            item.item_app_id
        };
        if id == 0 || item.item_description.is_empty() {
            warn!("Purchase receipt line item without id or description");
            break;
        }
        items.insert(id, decode_html_entities(&item.item_description));
    }
    items
}

fn decode_html_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
