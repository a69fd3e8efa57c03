//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 固定的事件频道目录。

use crate::error::{CoordError, Result};
use std::fmt;
use std::str::FromStr;

macro_rules! event_channels {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// 事件频道
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum EventChannel {
            $($variant),+
        }

        impl EventChannel {
            /// 目录中的全部频道
            pub const ALL: &'static [EventChannel] = &[$(EventChannel::$variant),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(EventChannel::$variant => $name),+
                }
            }
        }

        impl FromStr for EventChannel {
            type Err = CoordError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(EventChannel::$variant),)+
                    other => Err(CoordError::InvalidInput(format!(
                        "unknown event channel '{}'",
                        other
                    ))),
                }
            }
        }
    };
}

event_channels! {
    ProductCreated => "product.created",
    ProductUpdated => "product.updated",
    ProductDeleted => "product.deleted",
    ProductViewed => "product.viewed",
    UserRegistered => "user.registered",
    UserUpdated => "user.updated",
    UserDeleted => "user.deleted",
    UserLogin => "user.login",
    UserLogout => "user.logout",
    ShopCreated => "shop.created",
    ShopUpdated => "shop.updated",
    ShopDeleted => "shop.deleted",
    PurchaseCreated => "purchase.created",
    PurchaseCompleted => "purchase.completed",
    PurchaseFailed => "purchase.failed",
    PaymentInitiated => "payment.initiated",
    PaymentCompleted => "payment.completed",
    PaymentFailed => "payment.failed",
    PaymentRefunded => "payment.refunded",
    ReferralCreated => "referral.created",
    ReferralClicked => "referral.clicked",
    ReferralReward => "referral.reward",
    AnalyticsUpdate => "analytics.update",
    CacheInvalidate => "cache.invalidate",
    CacheWarm => "cache.warm",
    SystemMaintenance => "system.maintenance",
    SystemError => "system.error",
}

impl AsRef<str> for EventChannel {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
