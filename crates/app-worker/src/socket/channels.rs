//! Special channels tied to a connection's identity.
//!
//! | Channel | Who may subscribe |
//! |---------|-------------------|
//! | `#all` | every connection |
//! | `#default` | connections in the default group |
//! | `#group.<authGroup>` | connections in that auth group |
//! | `#user.<authId>` | connections whose token carries that auth id |
//!
//! Other channels are not access-checked here.

use crate::auth::AuthState;
use crate::token::Token;
use common::types::AuthId;

pub const ALL_CHANNEL: &str = "#all";
pub const DEFAULT_GROUP_CHANNEL: &str = "#default";
pub const GROUP_CHANNEL_PREFIX: &str = "#group.";
pub const USER_CHANNEL_PREFIX: &str = "#user.";

#[must_use]
pub fn user_channel(auth_id: &AuthId) -> String {
    format!("{USER_CHANNEL_PREFIX}{}", auth_id.key())
}

#[must_use]
pub fn group_channel(group: &str) -> String {
    format!("{GROUP_CHANNEL_PREFIX}{group}")
}

#[must_use]
pub fn is_special_channel(channel: &str) -> bool {
    channel == ALL_CHANNEL
        || channel == DEFAULT_GROUP_CHANNEL
        || channel.starts_with(GROUP_CHANNEL_PREFIX)
        || channel.starts_with(USER_CHANNEL_PREFIX)
}

/// Whether a connection with this identity may be subscribed to `channel`.
#[must_use]
pub fn channel_allowed(channel: &str, auth: &AuthState, token: Option<&Token>) -> bool {
    if channel == ALL_CHANNEL {
        return true;
    }
    if channel == DEFAULT_GROUP_CHANNEL {
        return auth.is_default();
    }
    if let Some(group) = channel.strip_prefix(GROUP_CHANNEL_PREFIX) {
        return !auth.is_default() && auth.group() == group;
    }
    if let Some(user) = channel.strip_prefix(USER_CHANNEL_PREFIX) {
        return token
            .and_then(|t| t.auth_id.as_ref())
            .is_some_and(|id| id.key() == user);
    }
    true
}
