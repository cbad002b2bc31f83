//! Activity log: one structured event per user action.

use tracing::info;

pub fn record(actor: &str, action: &str, detail: &str) {
    info!(target: "chatd::activity", user = actor, action, detail);
}
