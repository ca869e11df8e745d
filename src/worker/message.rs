//! Control messages posted to the worker.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Something a control message asks the registration to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
  /// Activate the waiting version now, without waiting for clients to go away
  SkipWaiting,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

/// Interpret a posted message.
///
/// Only `{"type": "SKIP_WAITING"}` is recognized; every other shape is
/// ignored.
pub fn handle_message(data: &Value) -> Option<ControlAction> {
  match serde_json::from_value::<ControlMessage>(data.clone()) {
    Ok(ControlMessage::SkipWaiting) => Some(ControlAction::SkipWaiting),
    Err(_) => {
      debug!(message = %data, "ignoring unrecognized message");
      None
    }
  }
}
